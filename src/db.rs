use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, named_params};

use crate::models::{Job, JobListItem, JobMetrics, JobStatus};
use crate::util::truncate_prompt;

/// Prompts longer than this are truncated (with a trailing `…`) in the
/// job-list projection.
const LIST_PROMPT_MAX: usize = 100;

/// Async-safe handle to the job store.
///
/// Wraps `JobStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobStore>>,
}

impl DbHandle {
    pub fn new(store: JobStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, JobStore>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Fields written in one update when a job completes.
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub completed_at: String,
    pub expires_at: String,
    pub preview_url: String,
    pub deployed_url: String,
    pub worker_name: String,
    pub build_log_key: Option<String>,
    pub deploy_log_key: Option<String>,
    pub metrics: JobMetrics,
}

/// Fields written alongside the error message when a job fails.
#[derive(Debug, Clone, Default)]
pub struct FailureUpdate {
    pub completed_at: String,
    pub expires_at: String,
    pub worker_name: Option<String>,
    pub build_log_key: Option<String>,
    pub deploy_log_key: Option<String>,
}

/// Row projection used by the cleanup sweeper.
#[derive(Debug, Clone)]
pub struct ExpirableJob {
    pub id: String,
    pub worker_name: Option<String>,
    pub build_log_key: Option<String>,
    pub deploy_log_key: Option<String>,
}

pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    prompt TEXT NOT NULL,
                    model TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending','running','completed','failed','expired')),
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    expires_at TEXT,
                    preview_url TEXT,
                    deployed_url TEXT,
                    error_message TEXT,
                    file_count INTEGER,
                    lines_of_code INTEGER,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    total_tokens INTEGER,
                    cost REAL,
                    llm_latency_ms INTEGER,
                    install_duration_ms INTEGER,
                    build_duration_ms INTEGER,
                    deploy_duration_ms INTEGER,
                    total_duration_ms INTEGER,
                    build_log_key TEXT,
                    deploy_log_key TEXT,
                    worker_name TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at DESC);
                ",
            )
            .context("Failed to create jobs table")?;
        Ok(())
    }

    const JOB_COLUMNS: &'static str = "id, prompt, model, status, created_at, started_at, \
         completed_at, expires_at, preview_url, deployed_url, error_message, file_count, \
         lines_of_code, prompt_tokens, completion_tokens, total_tokens, cost, llm_latency_ms, \
         install_duration_ms, build_duration_ms, deploy_duration_ms, total_duration_ms, \
         build_log_key, deploy_log_key, worker_name";

    pub fn create_job(&self, id: &str, prompt: &str, model: &str, created_at: &str) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (id, prompt, model, status, created_at)
                 VALUES (:id, :prompt, :model, 'pending', :created_at)",
                named_params! {
                    ":id": id,
                    ":prompt": prompt,
                    ":model": model,
                    ":created_at": created_at,
                },
            )
            .context("Failed to insert job")?;
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = :id", Self::JOB_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(named_params! { ":id": id }, JobRow::from_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read job row")?;
                Ok(Some(r.into_job()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self, limit: i64) -> Result<Vec<JobListItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, prompt, model, status, created_at, deployed_url
                 FROM jobs ORDER BY created_at DESC LIMIT :limit",
            )
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(named_params! { ":limit": limit }, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query jobs")?;
        let mut items = Vec::new();
        for row in rows {
            let (id, prompt, model, status, created_at, deployed_url) =
                row.context("Failed to read job list row")?;
            items.push(JobListItem {
                id,
                prompt: truncate_prompt(&prompt, LIST_PROMPT_MAX),
                model,
                status: JobStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
                created_at,
                deployed_url,
            });
        }
        Ok(items)
    }

    pub fn mark_running(&self, id: &str, started_at: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running', started_at = :started_at WHERE id = :id",
                named_params! { ":id": id, ":started_at": started_at },
            )
            .context("Failed to mark job running")?;
        anyhow::ensure!(n == 1, "Job {} not found", id);
        Ok(())
    }

    pub fn mark_completed(&self, id: &str, update: &CompletionUpdate) -> Result<()> {
        let m = &update.metrics;
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET
                    status = 'completed',
                    completed_at = :completed_at,
                    expires_at = :expires_at,
                    preview_url = :preview_url,
                    deployed_url = :deployed_url,
                    worker_name = :worker_name,
                    build_log_key = :build_log_key,
                    deploy_log_key = :deploy_log_key,
                    file_count = :file_count,
                    lines_of_code = :lines_of_code,
                    prompt_tokens = :prompt_tokens,
                    completion_tokens = :completion_tokens,
                    total_tokens = :total_tokens,
                    cost = :cost,
                    llm_latency_ms = :llm_latency_ms,
                    install_duration_ms = :install_duration_ms,
                    build_duration_ms = :build_duration_ms,
                    deploy_duration_ms = :deploy_duration_ms,
                    total_duration_ms = :total_duration_ms
                 WHERE id = :id",
                named_params! {
                    ":id": id,
                    ":completed_at": update.completed_at,
                    ":expires_at": update.expires_at,
                    ":preview_url": update.preview_url,
                    ":deployed_url": update.deployed_url,
                    ":worker_name": update.worker_name,
                    ":build_log_key": update.build_log_key,
                    ":deploy_log_key": update.deploy_log_key,
                    ":file_count": m.file_count,
                    ":lines_of_code": m.lines_of_code,
                    ":prompt_tokens": m.prompt_tokens,
                    ":completion_tokens": m.completion_tokens,
                    ":total_tokens": m.total_tokens,
                    ":cost": m.cost,
                    ":llm_latency_ms": m.llm_latency_ms,
                    ":install_duration_ms": m.install_duration_ms,
                    ":build_duration_ms": m.build_duration_ms,
                    ":deploy_duration_ms": m.deploy_duration_ms,
                    ":total_duration_ms": m.total_duration_ms,
                },
            )
            .context("Failed to mark job completed")?;
        anyhow::ensure!(n == 1, "Job {} not found", id);
        Ok(())
    }

    pub fn mark_failed(&self, id: &str, message: &str, update: &FailureUpdate) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET
                    status = 'failed',
                    error_message = :error_message,
                    completed_at = :completed_at,
                    expires_at = :expires_at,
                    worker_name = :worker_name,
                    build_log_key = :build_log_key,
                    deploy_log_key = :deploy_log_key
                 WHERE id = :id",
                named_params! {
                    ":id": id,
                    ":error_message": message,
                    ":completed_at": update.completed_at,
                    ":expires_at": update.expires_at,
                    ":worker_name": update.worker_name,
                    ":build_log_key": update.build_log_key,
                    ":deploy_log_key": update.deploy_log_key,
                },
            )
            .context("Failed to mark job failed")?;
        anyhow::ensure!(n == 1, "Job {} not found", id);
        Ok(())
    }

    pub fn get_job_log_keys(&self, id: &str) -> Result<Option<(Option<String>, Option<String>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT build_log_key, deploy_log_key FROM jobs WHERE id = :id")
            .context("Failed to prepare get_job_log_keys")?;
        let mut rows = stmt
            .query_map(named_params! { ":id": id }, |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })
            .context("Failed to query job log keys")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read log keys")?)),
            None => Ok(None),
        }
    }

    /// Jobs eligible for expiration: terminal status with an elapsed
    /// `expires_at`, oldest first, bounded per sweep.
    pub fn select_expirable(&self, now: &str, limit: i64) -> Result<Vec<ExpirableJob>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, worker_name, build_log_key, deploy_log_key FROM jobs
                 WHERE status IN ('completed', 'failed')
                   AND expires_at IS NOT NULL AND expires_at <= :now
                 ORDER BY expires_at LIMIT :limit",
            )
            .context("Failed to prepare select_expirable")?;
        let rows = stmt
            .query_map(named_params! { ":now": now, ":limit": limit }, |row| {
                Ok(ExpirableJob {
                    id: row.get(0)?,
                    worker_name: row.get(1)?,
                    build_log_key: row.get(2)?,
                    deploy_log_key: row.get(3)?,
                })
            })
            .context("Failed to query expirable jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read expirable row")?);
        }
        Ok(jobs)
    }

    /// Terminal transition: the worker and log artifacts are gone, so their
    /// references are cleared along with the status change.
    pub fn mark_expired(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET
                    status = 'expired',
                    worker_name = NULL,
                    build_log_key = NULL,
                    deploy_log_key = NULL
                 WHERE id = :id",
                named_params! { ":id": id },
            )
            .context("Failed to mark job expired")?;
        anyhow::ensure!(n == 1, "Job {} not found", id);
        Ok(())
    }
}

struct JobRow {
    id: String,
    prompt: String,
    model: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    expires_at: Option<String>,
    preview_url: Option<String>,
    deployed_url: Option<String>,
    error_message: Option<String>,
    file_count: Option<i64>,
    lines_of_code: Option<i64>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    cost: Option<f64>,
    llm_latency_ms: Option<i64>,
    install_duration_ms: Option<i64>,
    build_duration_ms: Option<i64>,
    deploy_duration_ms: Option<i64>,
    total_duration_ms: Option<i64>,
    build_log_key: Option<String>,
    deploy_log_key: Option<String>,
    worker_name: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            model: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            expires_at: row.get(7)?,
            preview_url: row.get(8)?,
            deployed_url: row.get(9)?,
            error_message: row.get(10)?,
            file_count: row.get(11)?,
            lines_of_code: row.get(12)?,
            prompt_tokens: row.get(13)?,
            completion_tokens: row.get(14)?,
            total_tokens: row.get(15)?,
            cost: row.get(16)?,
            llm_latency_ms: row.get(17)?,
            install_duration_ms: row.get(18)?,
            build_duration_ms: row.get(19)?,
            deploy_duration_ms: row.get(20)?,
            total_duration_ms: row.get(21)?,
            build_log_key: row.get(22)?,
            deploy_log_key: row.get(23)?,
            worker_name: row.get(24)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            prompt: self.prompt,
            model: self.model,
            status: JobStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            preview_url: self.preview_url,
            deployed_url: self.deployed_url,
            error_message: self.error_message,
            file_count: self.file_count,
            lines_of_code: self.lines_of_code,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cost: self.cost,
            llm_latency_ms: self.llm_latency_ms,
            install_duration_ms: self.install_duration_ms,
            build_duration_ms: self.build_duration_ms,
            deploy_duration_ms: self.deploy_duration_ms,
            total_duration_ms: self.total_duration_ms,
            build_log_key: self.build_log_key,
            deploy_log_key: self.deploy_log_key,
            worker_name: self.worker_name,
        })
    }
}
