//! Job pipeline: one forward sequence per job, driven by a detached task
//! per `POST /api/jobs` request. The pipeline owns the sandbox, emits the
//! progress-event stream, and is the only writer of its job row. LLM,
//! build, and deploy failures are caught once here: recorded as `failed`,
//! logs archived best-effort, and a terminal `error` event emitted. The
//! sandbox is destroyed on every exit path.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};

use crate::archive::{self, LogArchive};
use crate::builder::{self, BUILD_LOG, DEPLOY_LOG, INSTALL_LOG, read_log_tail};
use crate::config::Config;
use crate::db::{CompletionUpdate, DbHandle, FailureUpdate};
use crate::deploy::{self, sanitize_deploy_log};
use crate::errors::PipelineError;
use crate::events::{EventSink, SseEvent};
use crate::frameworks;
use crate::llm::{BASE_SYSTEM_PROMPT, FileGenerator};
use crate::models::{JobMetrics, worker_name_for};
use crate::sandbox::{Sandbox, SandboxRuntime};
use crate::util::count_newlines;

/// Retention window for completed and failed jobs.
pub const RETENTION_HOURS: i64 = 24;

/// Capability bindings the pipeline runs against. Everything is shared and
/// cheap to clone; per-job state lives on the task's stack.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: DbHandle,
    pub archive: Arc<dyn LogArchive>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub llm: Arc<dyn FileGenerator>,
    pub config: Arc<Config>,
}

/// Launch the pipeline for an already-inserted pending job. Detached: a
/// client disconnect closes the event sink but the job runs to completion.
pub fn spawn_job(
    deps: PipelineDeps,
    job_id: String,
    prompt: String,
    model: String,
    events: EventSink,
) {
    tokio::spawn(run_job(deps, job_id, prompt, model, events));
}

async fn run_job(
    deps: PipelineDeps,
    job_id: String,
    prompt: String,
    model: String,
    events: EventSink,
) {
    events.send(SseEvent::JobCreated {
        job_id: job_id.clone(),
    });

    let started_dt = Utc::now();
    let started_at = to_rfc3339(&started_dt);
    {
        let id = job_id.clone();
        let ts = started_at.clone();
        if let Err(e) = deps.store.call(move |db| db.mark_running(&id, &ts)).await {
            eprintln!("[pipeline] job {}: failed to mark running: {:#}", job_id, e);
            events.send(SseEvent::Error {
                message: "internal error starting job".to_string(),
            });
            return;
        }
    }

    let mut sandbox: Option<Arc<dyn Sandbox>> = None;
    let result = drive(&deps, &job_id, &prompt, &model, &events, &mut sandbox, &started_dt).await;

    if let Err(err) = result {
        let message = err.to_string();
        eprintln!(
            "[pipeline] job {} failed: {}",
            job_id,
            message.lines().next().unwrap_or(&message)
        );

        let (build_log_key, deploy_log_key) = match &sandbox {
            Some(sb) => archive_logs(&deps.archive, sb, &job_id).await,
            None => (None, None),
        };

        let completed_at = to_rfc3339(&Utc::now());
        let update = FailureUpdate {
            expires_at: plus_retention(&completed_at),
            completed_at,
            // Deterministic from the id; the sweeper tolerates a worker
            // that was never actually deployed (delete returns 404).
            worker_name: Some(worker_name_for(&job_id)),
            build_log_key,
            deploy_log_key,
        };
        {
            let id = job_id.clone();
            let msg = message.clone();
            if let Err(store_err) = deps
                .store
                .call(move |db| db.mark_failed(&id, &msg, &update))
                .await
            {
                // A store failure here must not replace the original error
                // on the stream.
                eprintln!(
                    "[pipeline] job {}: failed to record failure: {:#}",
                    job_id, store_err
                );
            }
        }
        events.send(SseEvent::Error { message });
    }

    if let Some(sb) = sandbox {
        if let Err(e) = sb.destroy().await {
            eprintln!("[pipeline] job {}: failed to destroy sandbox {}: {:#}", job_id, sb.id(), e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    deps: &PipelineDeps,
    job_id: &str,
    prompt: &str,
    model: &str,
    events: &EventSink,
    sandbox_slot: &mut Option<Arc<dyn Sandbox>>,
    started_dt: &DateTime<Utc>,
) -> Result<(), PipelineError> {
    // Generate.
    events.send(SseEvent::Generating);
    let system_prompt = compose_system_prompt(prompt);
    let generated = deps.llm.generate(model, &system_prompt, prompt).await?;
    events.send(SseEvent::Generated {
        file_count: generated.files.len(),
    });

    let file_count = generated.files.len() as i64;
    let lines_of_code: i64 = generated.files.iter().map(|f| count_newlines(&f.content)).sum();

    let mut files = generated.files;
    let resolution = frameworks::resolve(&files);
    let project_config = frameworks::normalize(&mut files, &resolution);

    // Build.
    let sandbox = deps
        .runtime
        .create(job_id)
        .await
        .map_err(PipelineError::Sandbox)?;
    *sandbox_slot = Some(Arc::clone(&sandbox));
    let timings = builder::run_build(&sandbox, &files, &project_config, job_id, events).await?;

    // Deploy.
    events.send(SseEvent::Deploying);
    let deploy_started = Instant::now();
    let deployed = deploy::run_deploy(&sandbox, &deps.config).await?;
    let deploy_duration_ms = deploy_started.elapsed().as_millis() as i64;
    events.send(SseEvent::Deployed {
        deployed_url: deployed.deployed_url.clone(),
    });

    // Archive (best effort; failures are logged, never fatal).
    let (build_log_key, deploy_log_key) = archive_logs(&deps.archive, &sandbox, job_id).await;

    // Finalize.
    let completed_at = to_rfc3339(&Utc::now());
    let metrics = JobMetrics {
        file_count,
        lines_of_code,
        prompt_tokens: generated.usage.prompt_tokens,
        completion_tokens: generated.usage.completion_tokens,
        total_tokens: generated.usage.total_tokens,
        cost: generated.usage.cost,
        llm_latency_ms: generated.latency_ms,
        install_duration_ms: timings.install_duration_ms,
        build_duration_ms: timings.build_duration_ms,
        deploy_duration_ms,
        total_duration_ms: ms_between(started_dt, &completed_at),
    };
    let update = CompletionUpdate {
        expires_at: plus_retention(&completed_at),
        completed_at,
        preview_url: deployed.deployed_url.clone(),
        deployed_url: deployed.deployed_url.clone(),
        worker_name: worker_name_for(job_id),
        build_log_key,
        deploy_log_key,
        metrics: metrics.clone(),
    };
    {
        let id = job_id.to_string();
        if let Err(e) = deps.store.call(move |db| db.mark_completed(&id, &update)).await {
            // The artifact is live; losing the row update is an operator
            // problem, not a client-visible failure.
            eprintln!("[pipeline] job {}: failed to record completion: {:#}", job_id, e);
        }
    }

    events.send(SseEvent::Complete {
        preview_url: deployed.deployed_url.clone(),
        deployed_url: deployed.deployed_url,
        metrics,
    });
    Ok(())
}

pub fn compose_system_prompt(prompt: &str) -> String {
    format!("{}\n\n{}", BASE_SYSTEM_PROMPT, frameworks::prompt_rules_for(prompt))
}

/// Upload whatever log tails the sandbox has; the build key falls back to
/// the install log when the build never started.
async fn archive_logs(
    archive: &Arc<dyn LogArchive>,
    sandbox: &Arc<dyn Sandbox>,
    job_id: &str,
) -> (Option<String>, Option<String>) {
    let mut build_key = None;
    let mut deploy_key = None;

    let mut build_tail = read_log_tail(sandbox, BUILD_LOG).await;
    if build_tail.is_empty() {
        build_tail = read_log_tail(sandbox, INSTALL_LOG).await;
    }
    if !build_tail.is_empty() {
        let key = archive::build_log_key(job_id);
        match archive.put(&key, &build_tail).await {
            Ok(()) => build_key = Some(key),
            Err(e) => eprintln!("[archive] job {}: build log upload failed: {:#}", job_id, e),
        }
    }

    let deploy_tail = sanitize_deploy_log(&read_log_tail(sandbox, DEPLOY_LOG).await);
    if !deploy_tail.is_empty() {
        let key = archive::deploy_log_key(job_id);
        match archive.put(&key, &deploy_tail).await {
            Ok(()) => deploy_key = Some(key),
            Err(e) => eprintln!("[archive] job {}: deploy log upload failed: {:#}", job_id, e),
        }
    }

    (build_key, deploy_key)
}

// ── Time helpers ─────────────────────────────────────────────────────

pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_rfc3339() -> String {
    to_rfc3339(&Utc::now())
}

/// `expires_at` for a job that reached a terminal state at `completed_at`.
pub fn plus_retention(completed_at: &str) -> String {
    let base = DateTime::parse_from_rfc3339(completed_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    to_rfc3339(&(base + ChronoDuration::hours(RETENTION_HOURS)))
}

fn ms_between(start: &DateTime<Utc>, end_ts: &str) -> i64 {
    let end = DateTime::parse_from_rfc3339(end_ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    (end - *start).num_milliseconds().max(0)
}
