//! Sandbox build driver: materializes the generated tree, runs install and
//! build with timeouts and heartbeats, verifies artifacts, and writes the
//! edge-worker deployment descriptor the deploy driver consumes.
//!
//! Exec output from the sandbox is not incremental, so every long command
//! redirects into a log file under `.nimbus/` and a poller tails that file
//! for live `log` events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::errors::PipelineError;
use crate::events::{EventSink, LogPhase, SseEvent};
use crate::frameworks::find_file;
use crate::models::{DeployTarget, GeneratedFile, NimbusConfig, worker_name_for};
use crate::sandbox::{ExecOutput, Sandbox};
use crate::util::tail_chars;

pub const PROJECT_ROOT: &str = "/root/app";
pub const LOG_DIR: &str = "/root/app/.nimbus";
pub const INSTALL_LOG: &str = "/root/app/.nimbus/install.log";
pub const BUILD_LOG: &str = "/root/app/.nimbus/build.log";
pub const DEPLOY_LOG: &str = "/root/app/.nimbus/deploy.log";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const BUILD_TIMEOUT: Duration = Duration::from_secs(180);
const NEXT_BUILD_TIMEOUT: Duration = Duration::from_secs(120);
const OPENNEXT_TIMEOUT: Duration = Duration::from_secs(60);
/// Short bookkeeping execs: mkdir, existence probes, tail reads.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const LOG_TAIL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_TAIL_CHARS: usize = 4000;
const TAIL_LINES: usize = 200;

const PASSTHROUGH_WORKER: &str = r#"export default {
  async fetch(request, env) {
    return env.ASSETS.fetch(request);
  },
};
"#;

#[derive(Debug, Clone, Default)]
pub struct BuildTimings {
    pub install_duration_ms: i64,
    pub build_duration_ms: i64,
}

/// Run the full build inside an already-provisioned sandbox. Emits
/// `scaffolding`/`writing`/`installing`/`building` stage events plus
/// interleaved `log` events; returns install/build durations.
pub async fn run_build(
    sandbox: &Arc<dyn Sandbox>,
    files: &[GeneratedFile],
    config: &NimbusConfig,
    job_id: &str,
    events: &EventSink,
) -> Result<BuildTimings, PipelineError> {
    validate_paths(files)?;
    let worker_name = worker_name_for(job_id);
    let is_next_workers = config.framework.as_deref() == Some("next")
        && config.target == Some(DeployTarget::Workers);

    // Scaffold the project root and log directory.
    events.send(SseEvent::Scaffolding);
    exec_checked(sandbox, &format!("mkdir -p {}", LOG_DIR), PROBE_TIMEOUT, "scaffold").await?;

    // Materialize the tree verbatim.
    events.send(SseEvent::Writing);
    for file in files {
        sandbox
            .write_file(&format!("{}/{}", PROJECT_ROOT, file.path), &file.content)
            .await
            .map_err(|e| build_error(sandbox, "write", format!("{:#}", e), String::new()))?;
    }

    // Next-on-workers needs its wrangler config before the OpenNext build.
    if is_next_workers {
        let descriptor = render_wrangler(&next_wrangler_config(&worker_name))?;
        for path in ["wrangler.toml", "wrangler.nimbus.toml"] {
            sandbox
                .write_file(&format!("{}/{}", PROJECT_ROOT, path), &descriptor)
                .await
                .map_err(|e| build_error(sandbox, "write", format!("{:#}", e), String::new()))?;
        }
    }

    let package_json: Option<Value> =
        find_file(files, "package.json").and_then(|f| serde_json::from_str(&f.content).ok());

    // Install.
    events.send(SseEvent::Installing);
    let install_duration_ms = if package_json.is_some() {
        run_logged_stage(
            sandbox,
            events,
            LogPhase::Install,
            SseEvent::Installing,
            &format!("cd {} && bun install --no-save > {} 2>&1", PROJECT_ROOT, INSTALL_LOG),
            "bun install",
            INSTALL_LOG,
            INSTALL_TIMEOUT,
        )
        .await?
    } else {
        0
    };

    // Build.
    events.send(SseEvent::Building);
    let has_build_script = package_json
        .as_ref()
        .and_then(|p| p.get("scripts"))
        .and_then(|s| s.get("build"))
        .and_then(|b| b.as_str())
        .is_some();
    let build_duration_ms = if has_build_script {
        if is_next_workers {
            run_next_build(sandbox, events).await?
        } else {
            run_logged_stage(
                sandbox,
                events,
                LogPhase::Build,
                SseEvent::Building,
                &format!("cd {} && CI=true bun run build > {} 2>&1", PROJECT_ROOT, BUILD_LOG),
                "bun run build",
                BUILD_LOG,
                BUILD_TIMEOUT,
            )
            .await?
        }
    } else {
        0
    };

    // Verify artifacts and write the authoritative deployment descriptor.
    let descriptor = resolve_deployment(sandbox, files, config, is_next_workers, &worker_name).await?;
    sandbox
        .write_file(
            &format!("{}/wrangler.nimbus.toml", PROJECT_ROOT),
            &render_wrangler(&descriptor)?,
        )
        .await
        .map_err(|e| build_error(sandbox, "write", format!("{:#}", e), String::new()))?;

    Ok(BuildTimings {
        install_duration_ms,
        build_duration_ms,
    })
}

/// Next on workers: `next build` for the standalone bundle, then OpenNext
/// repackaging for the workers runtime. Both append to the same build log.
async fn run_next_build(
    sandbox: &Arc<dyn Sandbox>,
    events: &EventSink,
) -> Result<i64, PipelineError> {
    let started = Instant::now();

    run_logged_stage(
        sandbox,
        events,
        LogPhase::Build,
        SseEvent::Building,
        &format!("cd {} && bunx next build > {} 2>&1", PROJECT_ROOT, BUILD_LOG),
        "bunx next build",
        BUILD_LOG,
        NEXT_BUILD_TIMEOUT,
    )
    .await?;

    require_in_sandbox(sandbox, "-d", ".next/standalone", "next standalone output").await?;

    run_logged_stage(
        sandbox,
        events,
        LogPhase::Build,
        SseEvent::Building,
        &format!(
            "cd {} && bunx opennextjs-cloudflare build --skipNextBuild --skipWranglerConfigCheck --noMinify >> {} 2>&1",
            PROJECT_ROOT, BUILD_LOG
        ),
        "bunx opennextjs-cloudflare build",
        BUILD_LOG,
        OPENNEXT_TIMEOUT,
    )
    .await?;

    Ok(started.elapsed().as_millis() as i64)
}

/// Decide main entry and assets directory, enforcing per-target artifact
/// requirements, and produce the wrangler descriptor.
async fn resolve_deployment(
    sandbox: &Arc<dyn Sandbox>,
    files: &[GeneratedFile],
    config: &NimbusConfig,
    is_next_workers: bool,
    worker_name: &str,
) -> Result<WranglerConfig, PipelineError> {
    if is_next_workers {
        require_in_sandbox(sandbox, "-f", ".open-next/worker.js", "OpenNext worker bundle").await?;
        require_in_sandbox(sandbox, "-d", ".open-next/assets", "OpenNext assets").await?;
        return Ok(next_wrangler_config(worker_name));
    }

    if config.target == Some(DeployTarget::Workers) {
        let entry = config.worker_entry.clone().ok_or_else(|| {
            build_error(
                sandbox,
                "build",
                "workers target requires a workerEntry in nimbus.config.json".to_string(),
                String::new(),
            )
        })?;
        require_in_sandbox(sandbox, "-f", &entry, "worker entry").await?;
        if let Some(dir) = &config.assets_dir {
            require_in_sandbox(sandbox, "-d", dir, "assets directory").await?;
            ensure_assetsignore(sandbox, dir).await?;
        }
        return Ok(WranglerConfig::workers(worker_name, &entry, config.assets_dir.as_deref()));
    }

    // Static / default: pick the first existing output directory, fall back
    // to the project root for buildless sites.
    let mut assets_dir = None;
    let declared = config.assets_dir.as_deref();
    for candidate in declared.into_iter().chain(["dist", "build", ".output", "out"]) {
        if path_exists(sandbox, "-d", candidate).await? {
            assets_dir = Some(candidate.to_string());
            break;
        }
    }
    let assets_dir = assets_dir.unwrap_or_else(|| ".".to_string());

    let entry = match choose_static_entry(files, config) {
        Some(entry) => entry,
        None => {
            sandbox
                .write_file(&format!("{}/worker.js", PROJECT_ROOT), PASSTHROUGH_WORKER)
                .await
                .map_err(|e| build_error(sandbox, "write", format!("{:#}", e), String::new()))?;
            "worker.js".to_string()
        }
    };

    Ok(WranglerConfig::workers(worker_name, &entry, Some(&assets_dir)))
}

/// Static-site worker entry: a configured entry that actually exists in the
/// generated tree, else an explicit `worker.{js,ts}`, else none (the caller
/// synthesizes a pass-through worker).
pub fn choose_static_entry(files: &[GeneratedFile], config: &NimbusConfig) -> Option<String> {
    if let Some(entry) = &config.worker_entry {
        if find_file(files, entry).is_some() {
            return Some(entry.clone());
        }
    }
    for candidate in ["worker.js", "worker.ts"] {
        if find_file(files, candidate).is_some() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Keep the assets layer from shadowing an embedded `_worker.js` bundle.
async fn ensure_assetsignore(
    sandbox: &Arc<dyn Sandbox>,
    assets_dir: &str,
) -> Result<(), PipelineError> {
    if !path_exists(sandbox, "-d", &format!("{}/_worker.js", assets_dir)).await? {
        return Ok(());
    }
    let cmd = format!(
        "cd {}/{} && (grep -qx '_worker.js' .assetsignore 2>/dev/null || echo '_worker.js' >> .assetsignore)",
        PROJECT_ROOT, assets_dir
    );
    exec_checked(sandbox, &cmd, PROBE_TIMEOUT, "assetsignore").await?;
    Ok(())
}

// ── Stage execution with heartbeat + log streaming ───────────────────

/// Run one long command with its heartbeat ticker and log-tail streamer.
/// Both child tasks are stopped when the command finishes, before the
/// stage's terminating event can be emitted by the caller.
#[allow(clippy::too_many_arguments)]
async fn run_logged_stage(
    sandbox: &Arc<dyn Sandbox>,
    events: &EventSink,
    phase: LogPhase,
    heartbeat: SseEvent,
    cmd: &str,
    label: &str,
    log_path: &str,
    timeout: Duration,
) -> Result<i64, PipelineError> {
    let streams = StageStreams::start(
        Arc::clone(sandbox),
        events.clone(),
        heartbeat,
        log_path.to_string(),
        phase,
    );
    let started = Instant::now();
    let result = exec_raced(sandbox, cmd, timeout).await;
    streams.stop();

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            let tail = read_log_tail(sandbox, log_path).await;
            return Err(build_error(sandbox, phase.as_str(), format!("{:#}", e), tail));
        }
    };
    if !output.success() {
        let tail = read_log_tail(sandbox, log_path).await;
        return Err(build_error(
            sandbox,
            phase.as_str(),
            format!("{} exited with code {}", label, output.exit_code),
            tail,
        ));
    }
    Ok(started.elapsed().as_millis() as i64)
}

struct StageStreams {
    heartbeat: JoinHandle<()>,
    tailer: JoinHandle<()>,
}

impl StageStreams {
    fn start(
        sandbox: Arc<dyn Sandbox>,
        events: EventSink,
        heartbeat_event: SseEvent,
        log_path: String,
        phase: LogPhase,
    ) -> Self {
        let hb_events = events.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hb_events.send(heartbeat_event.clone());
            }
        });

        let tailer = tokio::spawn(async move {
            let mut last_line = String::new();
            let mut ticker = tokio::time::interval(LOG_TAIL_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let tail = read_log_tail(&sandbox, &log_path).await;
                if tail.is_empty() {
                    continue;
                }
                let (fresh, new_last) = diff_tail(&last_line, &tail);
                if !fresh.is_empty() {
                    events.send(SseEvent::Log {
                        phase,
                        message: fresh,
                    });
                }
                last_line = new_last;
            }
        });

        Self { heartbeat, tailer }
    }

    fn stop(self) {
        self.heartbeat.abort();
        self.tailer.abort();
    }
}

/// Last 200 lines of a log file, truncated to the trailing 4 000 chars.
/// Errors read as an empty tail; the poller just tries again.
pub async fn read_log_tail(sandbox: &Arc<dyn Sandbox>, path: &str) -> String {
    let cmd = format!("tail -n {} {} 2>/dev/null || true", TAIL_LINES, path);
    match sandbox.exec(&cmd, PROBE_TIMEOUT).await {
        Ok(output) => tail_chars(&output.stdout, MAX_TAIL_CHARS).to_string(),
        Err(_) => String::new(),
    }
}

/// Emit only content that appeared after the previously seen trailing line.
/// Returns the fresh content and the new trailing line to remember.
fn diff_tail(last_line: &str, tail: &str) -> (String, String) {
    let new_last = tail.lines().last().unwrap_or("").to_string();
    if last_line.is_empty() {
        return (tail.to_string(), new_last);
    }
    match tail.rfind(last_line) {
        Some(pos) => {
            let after = &tail[pos + last_line.len()..];
            (after.trim_start_matches('\n').to_string(), new_last)
        }
        None => (tail.to_string(), new_last),
    }
}

// ── Exec helpers ─────────────────────────────────────────────────────

/// Host-side race against a timer of the same duration the sandbox was
/// given; a hung exec raises with the command string.
async fn exec_raced(
    sandbox: &Arc<dyn Sandbox>,
    cmd: &str,
    timeout: Duration,
) -> anyhow::Result<ExecOutput> {
    match tokio::time::timeout(timeout, sandbox.exec(cmd, timeout)).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("timed out after {}s: {}", timeout.as_secs(), cmd),
    }
}

async fn exec_checked(
    sandbox: &Arc<dyn Sandbox>,
    cmd: &str,
    timeout: Duration,
    phase: &str,
) -> Result<ExecOutput, PipelineError> {
    let output = exec_raced(sandbox, cmd, timeout)
        .await
        .map_err(|e| build_error(sandbox, phase, format!("{:#}", e), String::new()))?;
    if !output.success() {
        return Err(build_error(
            sandbox,
            phase,
            format!("'{}' exited with code {}", cmd, output.exit_code),
            output.stderr,
        ));
    }
    Ok(output)
}

async fn path_exists(
    sandbox: &Arc<dyn Sandbox>,
    test_flag: &str,
    rel_path: &str,
) -> Result<bool, PipelineError> {
    let cmd = format!("test {} {}/{}", test_flag, PROJECT_ROOT, rel_path);
    let output = exec_raced(sandbox, &cmd, PROBE_TIMEOUT)
        .await
        .map_err(|e| build_error(sandbox, "build", format!("{:#}", e), String::new()))?;
    Ok(output.success())
}

async fn require_in_sandbox(
    sandbox: &Arc<dyn Sandbox>,
    test_flag: &str,
    rel_path: &str,
    what: &str,
) -> Result<(), PipelineError> {
    if path_exists(sandbox, test_flag, rel_path).await? {
        return Ok(());
    }
    let tail = read_log_tail(sandbox, BUILD_LOG).await;
    Err(build_error(
        sandbox,
        "build",
        format!("{} missing at {}", what, rel_path),
        tail,
    ))
}

fn build_error(
    sandbox: &Arc<dyn Sandbox>,
    phase: &str,
    message: String,
    log_tail: String,
) -> PipelineError {
    PipelineError::Build {
        sandbox_id: sandbox.id().to_string(),
        phase: phase.to_string(),
        message,
        log_tail,
    }
}

/// Generated paths must stay inside the project root; no absolute paths,
/// no `..` traversal, no quote characters that would break shell probes.
fn validate_paths(files: &[GeneratedFile]) -> Result<(), PipelineError> {
    for file in files {
        let path = file.path.as_str();
        let escapes = path.starts_with('/')
            || path.split('/').any(|part| part == "..")
            || path.contains('\'')
            || path.is_empty();
        if escapes {
            return Err(PipelineError::Llm(format!(
                "generated file path escapes the project root: {:?}",
                path
            )));
        }
    }
    Ok(())
}

// ── Wrangler descriptor ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WranglerConfig {
    pub name: String,
    pub main: String,
    pub compatibility_date: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility_flags: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<WranglerAssets>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WranglerAssets {
    pub directory: String,
    pub binding: &'static str,
}

const COMPATIBILITY_DATE: &str = "2025-04-01";

impl WranglerConfig {
    fn workers(worker_name: &str, main: &str, assets_dir: Option<&str>) -> Self {
        Self {
            name: worker_name.to_string(),
            main: main.to_string(),
            compatibility_date: COMPATIBILITY_DATE,
            compatibility_flags: None,
            assets: assets_dir.map(|dir| WranglerAssets {
                directory: dir.to_string(),
                binding: "ASSETS",
            }),
        }
    }
}

fn next_wrangler_config(worker_name: &str) -> WranglerConfig {
    WranglerConfig {
        name: worker_name.to_string(),
        main: ".open-next/worker.js".to_string(),
        compatibility_date: COMPATIBILITY_DATE,
        compatibility_flags: Some(vec!["nodejs_compat"]),
        assets: Some(WranglerAssets {
            directory: ".open-next/assets".to_string(),
            binding: "ASSETS",
        }),
    }
}

fn render_wrangler(config: &WranglerConfig) -> Result<String, PipelineError> {
    toml::to_string(config)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("wrangler config render: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn file(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    /// Scripted sandbox: records writes and execs, answers existence probes
    /// from a set, and fails commands on demand.
    struct ScriptedSandbox {
        writes: Mutex<Vec<String>>,
        execs: Mutex<Vec<String>>,
        existing: HashSet<String>,
        tails: HashMap<String, String>,
        failing_cmd: Option<&'static str>,
    }

    impl ScriptedSandbox {
        fn new() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                execs: Mutex::new(Vec::new()),
                existing: HashSet::new(),
                tails: HashMap::new(),
                failing_cmd: None,
            }
        }

        fn written_paths(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }

        fn ran(&self, fragment: &str) -> bool {
            self.execs.lock().unwrap().iter().any(|c| c.contains(fragment))
        }
    }

    #[async_trait::async_trait]
    impl Sandbox for ScriptedSandbox {
        fn id(&self) -> &str {
            "sbx-test"
        }

        async fn exec(&self, cmd: &str, _timeout: Duration) -> anyhow::Result<ExecOutput> {
            self.execs.lock().unwrap().push(cmd.to_string());
            if let Some(fragment) = self.failing_cmd {
                if cmd.contains(fragment) {
                    return Ok(ExecOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: String::new(),
                    });
                }
            }
            if let Some(rest) = cmd.strip_prefix("test ") {
                let path = rest.split_whitespace().nth(1).unwrap_or("");
                let exists = self.existing.contains(path);
                return Ok(ExecOutput {
                    exit_code: if exists { 0 } else { 1 },
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            if cmd.starts_with("tail ") {
                let path = cmd.split_whitespace().nth(3).unwrap_or("");
                let body = self.tails.get(path).cloned().unwrap_or_default();
                return Ok(ExecOutput {
                    exit_code: 0,
                    stdout: body,
                    stderr: String::new(),
                });
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn write_file(&self, path: &str, _contents: &str) -> anyhow::Result<()> {
            self.writes.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn static_config() -> NimbusConfig {
        NimbusConfig {
            framework: None,
            target: Some(DeployTarget::Static),
            assets_dir: None,
            worker_entry: None,
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SseEvent>) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_buildless_static_site_happy_path() {
        let sandbox: Arc<dyn Sandbox> = Arc::new(ScriptedSandbox::new());
        let (events, mut rx) = EventSink::channel();
        let files = vec![
            file("index.html", "<html></html>"),
            file("styles.css", "body{}"),
            file("script.js", "console.log(1)"),
        ];

        let timings = run_build(&sandbox, &files, &static_config(), "job_a1b2c3d4", &events)
            .await
            .unwrap();
        assert_eq!(timings.install_duration_ms, 0);
        assert_eq!(timings.build_duration_ms, 0);

        let names: Vec<&str> = drain(&mut rx)
            .iter()
            .map(|e| match e {
                SseEvent::Scaffolding => "scaffolding",
                SseEvent::Writing => "writing",
                SseEvent::Installing => "installing",
                SseEvent::Building => "building",
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(names, ["scaffolding", "writing", "installing", "building"]);
    }

    #[tokio::test]
    async fn test_buildless_static_site_synthesizes_passthrough_worker() {
        let scripted = Arc::new(ScriptedSandbox::new());
        let sandbox: Arc<dyn Sandbox> = scripted.clone();
        let (events, _rx) = EventSink::channel();
        let files = vec![file("index.html", "<html></html>")];

        run_build(&sandbox, &files, &static_config(), "job_a1b2c3d4", &events)
            .await
            .unwrap();

        let writes = scripted.written_paths();
        assert!(writes.contains(&"/root/app/worker.js".to_string()));
        assert!(writes.contains(&"/root/app/wrangler.nimbus.toml".to_string()));
    }

    #[tokio::test]
    async fn test_build_failure_carries_sandbox_id_and_tail() {
        let mut scripted = ScriptedSandbox::new();
        scripted.failing_cmd = Some("bun run build");
        scripted.tails.insert(
            BUILD_LOG.to_string(),
            "error TS2304: Cannot find name 'foo'\n".to_string(),
        );
        let sandbox: Arc<dyn Sandbox> = Arc::new(scripted);
        let (events, _rx) = EventSink::channel();
        let files = vec![file(
            "package.json",
            r#"{"scripts": {"build": "vite build"}}"#,
        )];

        let err = run_build(&sandbox, &files, &static_config(), "job_ff000001", &events)
            .await
            .unwrap_err();
        match &err {
            PipelineError::Build {
                sandbox_id,
                phase,
                log_tail,
                ..
            } => {
                assert_eq!(sandbox_id, "sbx-test");
                assert_eq!(phase, "build");
                assert!(log_tail.contains("TS2304"));
            }
            other => panic!("expected build error, got {:?}", other),
        }
        assert!(err.to_string().contains("--- build log (tail) ---"));
    }

    #[tokio::test]
    async fn test_workers_target_requires_worker_entry() {
        let sandbox: Arc<dyn Sandbox> = Arc::new(ScriptedSandbox::new());
        let (events, _rx) = EventSink::channel();
        let config = NimbusConfig {
            framework: None,
            target: Some(DeployTarget::Workers),
            assets_dir: None,
            worker_entry: None,
        };
        let err = run_build(&sandbox, &[], &config, "job_ff000002", &events)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workerEntry"));
    }

    #[tokio::test]
    async fn test_astro_workers_artifacts_and_assetsignore() {
        let mut scripted = ScriptedSandbox::new();
        for path in [
            "/root/app/dist",
            "/root/app/dist/_worker.js",
            "/root/app/dist/_worker.js/index.js",
        ] {
            scripted.existing.insert(path.to_string());
        }
        let scripted = Arc::new(scripted);
        let sandbox: Arc<dyn Sandbox> = scripted.clone();
        let (events, _rx) = EventSink::channel();

        let config = NimbusConfig {
            framework: Some("astro".to_string()),
            target: Some(DeployTarget::Workers),
            assets_dir: Some("dist".to_string()),
            worker_entry: Some("dist/_worker.js/index.js".to_string()),
        };
        let files = vec![
            file(
                "package.json",
                r#"{"dependencies": {"astro": "latest"}, "scripts": {"build": "astro build"}}"#,
            ),
            file("src/pages/index.astro", "---\n---\n<h1>hi</h1>"),
        ];

        run_build(&sandbox, &files, &config, "job_a1b2c3d4", &events)
            .await
            .unwrap();

        assert!(scripted.ran("bun install --no-save"));
        assert!(scripted.ran("bun run build"));
        // The embedded _worker.js bundle must be kept out of the assets layer.
        assert!(scripted.ran("echo '_worker.js' >> .assetsignore"));
        assert!(
            scripted
                .written_paths()
                .contains(&"/root/app/wrangler.nimbus.toml".to_string())
        );
    }

    #[tokio::test]
    async fn test_next_workers_build_sequence() {
        let mut scripted = ScriptedSandbox::new();
        for path in [
            "/root/app/.next/standalone",
            "/root/app/.open-next/worker.js",
            "/root/app/.open-next/assets",
        ] {
            scripted.existing.insert(path.to_string());
        }
        let scripted = Arc::new(scripted);
        let sandbox: Arc<dyn Sandbox> = scripted.clone();
        let (events, _rx) = EventSink::channel();

        let config = NimbusConfig {
            framework: Some("next".to_string()),
            target: Some(DeployTarget::Workers),
            assets_dir: Some(".open-next/assets".to_string()),
            worker_entry: Some(".open-next/worker.js".to_string()),
        };
        let files = vec![file(
            "package.json",
            r#"{"dependencies": {"next": "latest"}, "scripts": {"build": "next build"}}"#,
        )];

        run_build(&sandbox, &files, &config, "job_a1b2c3d4", &events)
            .await
            .unwrap();

        assert!(scripted.ran("bunx next build"));
        assert!(scripted.ran("bunx opennextjs-cloudflare build --skipNextBuild"));
        // Pre-build descriptor goes to both file names.
        let writes = scripted.written_paths();
        assert!(writes.contains(&"/root/app/wrangler.toml".to_string()));
        assert!(writes.contains(&"/root/app/wrangler.nimbus.toml".to_string()));
    }

    #[tokio::test]
    async fn test_next_workers_missing_artifacts_is_a_build_failure() {
        let mut scripted = ScriptedSandbox::new();
        // next build ran but OpenNext never produced the worker bundle.
        scripted.existing.insert("/root/app/.next/standalone".to_string());
        let sandbox: Arc<dyn Sandbox> = Arc::new(scripted);
        let (events, _rx) = EventSink::channel();

        let config = NimbusConfig {
            framework: Some("next".to_string()),
            target: Some(DeployTarget::Workers),
            assets_dir: None,
            worker_entry: None,
        };
        let files = vec![file(
            "package.json",
            r#"{"scripts": {"build": "next build"}}"#,
        )];

        let err = run_build(&sandbox, &files, &config, "job_ff000003", &events)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("OpenNext worker bundle"));
    }

    #[test]
    fn test_validate_paths_rejects_escapes() {
        assert!(validate_paths(&[file("/etc/passwd", "")]).is_err());
        assert!(validate_paths(&[file("../outside", "")]).is_err());
        assert!(validate_paths(&[file("src/../../outside", "")]).is_err());
        assert!(validate_paths(&[file("", "")]).is_err());
        assert!(validate_paths(&[file("src/app/page.tsx", "")]).is_ok());
        assert!(validate_paths(&[file("deep/../sibling", "")]).is_err());
    }

    #[test]
    fn test_choose_static_entry_precedence() {
        let mut config = static_config();
        config.worker_entry = Some("custom/worker.js".to_string());

        // Configured entry must actually exist in the tree.
        assert_eq!(choose_static_entry(&[file("index.html", "")], &config), None);

        let with_custom = vec![file("custom/worker.js", ""), file("worker.js", "")];
        assert_eq!(
            choose_static_entry(&with_custom, &config).as_deref(),
            Some("custom/worker.js")
        );

        let with_plain = vec![file("worker.ts", "")];
        assert_eq!(
            choose_static_entry(&with_plain, &static_config()).as_deref(),
            Some("worker.ts")
        );
    }

    #[test]
    fn test_diff_tail_emits_only_new_lines() {
        let (first, last) = diff_tail("", "line 1\nline 2");
        assert_eq!(first, "line 1\nline 2");
        assert_eq!(last, "line 2");

        let (fresh, last) = diff_tail(&last, "line 1\nline 2\nline 3\nline 4");
        assert_eq!(fresh, "line 3\nline 4");
        assert_eq!(last, "line 4");

        // Log rotated out from under us: emit everything we can see.
        let (all, _) = diff_tail("gone", "new 1\nnew 2");
        assert_eq!(all, "new 1\nnew 2");
    }

    #[test]
    fn test_wrangler_render_static() {
        let config = WranglerConfig::workers("nimbus-a1b2c3d4", "worker.js", Some("."));
        let rendered = render_wrangler(&config).unwrap();
        assert!(rendered.contains("name = \"nimbus-a1b2c3d4\""));
        assert!(rendered.contains("main = \"worker.js\""));
        assert!(rendered.contains("[assets]"));
        assert!(rendered.contains("binding = \"ASSETS\""));
        assert!(!rendered.contains("compatibility_flags"));
    }

    #[test]
    fn test_wrangler_render_next() {
        let rendered = render_wrangler(&next_wrangler_config("nimbus-a1b2c3d4")).unwrap();
        assert!(rendered.contains("main = \".open-next/worker.js\""));
        assert!(rendered.contains("compatibility_flags = [\"nodejs_compat\"]"));
        assert!(rendered.contains("directory = \".open-next/assets\""));
    }
}
