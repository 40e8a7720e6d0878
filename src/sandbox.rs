//! Sandbox capability bindings and the Docker-backed runtime.
//!
//! The build and deploy drivers only see the `Sandbox` contract: `exec`,
//! `write_file`, `destroy`. Exec output is collected, not incremental;
//! interactive progress comes from tailing log files the drivers redirect
//! into (see `builder`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

/// Label stamped on every sandbox container so stale ones can be pruned.
const SANDBOX_LABEL: &str = "nimbus.sandbox";
/// Resource ceilings for one build sandbox.
const SANDBOX_MEMORY_BYTES: i64 = 4 * 1024 * 1024 * 1024;
const SANDBOX_NANO_CPUS: i64 = 2_000_000_000;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a shell command, collecting stdout/stderr until it exits or the
    /// timeout elapses.
    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Write `contents` to `path`, creating parent directories as needed.
    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;

    /// Tear the sandbox down. Always called, on every pipeline exit path.
    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn create(&self, job_id: &str) -> Result<Arc<dyn Sandbox>>;
}

/// Docker-daemon-backed sandbox runtime.
pub struct DockerRuntime {
    docker: Docker,
    image: String,
}

impl DockerRuntime {
    /// Connect to the Docker daemon via the unix socket.
    /// Returns None if Docker is not available.
    pub async fn connect(image: String) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker, image })
    }

    /// Remove sandbox containers older than `max_age_secs`. Leftovers exist
    /// only after an unclean shutdown; teardown removes them normally.
    pub async fn prune_stale(&self, max_age_secs: i64) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", SANDBOX_LABEL)],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list sandbox containers")?;

        let cutoff = chrono::Utc::now().timestamp() - max_age_secs;
        let mut pruned = 0;
        for container in containers {
            let created = container.created.unwrap_or(0);
            let Some(id) = container.id else { continue };
            if created < cutoff {
                let removed = self
                    .docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                match removed {
                    Ok(()) => pruned += 1,
                    Err(e) => eprintln!("[sandbox] failed to prune container {}: {}", id, e),
                }
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, job_id: &str) -> Result<Arc<dyn Sandbox>> {
        let name = format!("nimbus-sbx-{}", job_id);
        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
        labels.insert("nimbus.job".to_string(), job_id.to_string());

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                Config {
                    image: Some(self.image.clone()),
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    labels: Some(labels),
                    working_dir: Some("/root".to_string()),
                    host_config: Some(HostConfig {
                        memory: Some(SANDBOX_MEMORY_BYTES),
                        nano_cpus: Some(SANDBOX_NANO_CPUS),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create sandbox container")?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .context("Failed to start sandbox container")?;

        // Short id, the same one the docker CLI shows.
        let short_id = created.id.chars().take(12).collect();
        Ok(Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id: created.id,
            short_id,
        }))
    }
}

pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
    short_id: String,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.short_id
    }

    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec!["sh".to_string(), "-lc".to_string(), cmd.to_string()]),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .context("Failed to start exec")?
            {
                while let Some(chunk) = output.next().await {
                    match chunk.context("Exec stream error")? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            Ok::<(String, String), anyhow::Error>((stdout, stderr))
        };

        let (stdout, stderr) = match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "command timed out after {}s: {}",
                timeout.as_secs(),
                cmd
            ),
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        // `$0` is bound to the target path so no shell quoting of the path
        // is ever needed.
        let script = r#"mkdir -p -- "$(dirname -- "$0")" && cat > "$0""#;
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        script.to_string(),
                        path.to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create write exec")?;

        if let StartExecResults::Attached {
            mut output,
            mut input,
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start write exec")?
        {
            input
                .write_all(contents.as_bytes())
                .await
                .with_context(|| format!("Failed to stream contents of {}", path))?;
            input
                .shutdown()
                .await
                .with_context(|| format!("Failed to close stdin for {}", path))?;
            drop(input);
            while let Some(chunk) = output.next().await {
                chunk.context("Write exec stream error")?;
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect write exec")?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        anyhow::ensure!(exit_code == 0, "write of {} exited with code {}", path, exit_code);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove sandbox {}", self.short_id))?;
        Ok(())
    }
}
