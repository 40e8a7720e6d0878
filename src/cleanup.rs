//! Cleanup sweeper: expires terminal jobs past their retention window,
//! deletes their deployed workers, and purges archived logs. Idempotent per
//! row; one bad row never blocks the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::archive::LogArchive;
use crate::cloudflare::WorkerApi;
use crate::db::DbHandle;
use crate::pipeline::now_rfc3339;

/// Upper bound on rows handled per sweep.
const SWEEP_BATCH: i64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub expired: usize,
    pub skipped: usize,
}

pub struct Sweeper {
    store: DbHandle,
    archive: Arc<dyn LogArchive>,
    workers: Arc<dyn WorkerApi>,
}

impl Sweeper {
    pub fn new(store: DbHandle, archive: Arc<dyn LogArchive>, workers: Arc<dyn WorkerApi>) -> Self {
        Self {
            store,
            archive,
            workers,
        }
    }

    /// One pass: select up to 50 due jobs, release their external
    /// resources, then flip them to `expired`. A row whose worker or log
    /// deletion fails keeps its status and is retried on the next sweep.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let now = now_rfc3339();
        let due = self
            .store
            .call(move |db| db.select_expirable(&now, SWEEP_BATCH))
            .await?;

        let mut stats = SweepStats::default();
        for job in due {
            stats.scanned += 1;

            if let Some(name) = &job.worker_name {
                if let Err(e) = self.workers.delete_worker(name).await {
                    eprintln!(
                        "[sweeper] job {}: worker delete failed, skipping: {:#}",
                        job.id, e
                    );
                    stats.skipped += 1;
                    continue;
                }
            }

            let mut purge_failed = false;
            for key in [&job.build_log_key, &job.deploy_log_key].into_iter().flatten() {
                if let Err(e) = self.archive.delete(key).await {
                    eprintln!(
                        "[sweeper] job {}: log purge failed for {}, skipping: {:#}",
                        job.id, key, e
                    );
                    purge_failed = true;
                    break;
                }
            }
            if purge_failed {
                stats.skipped += 1;
                continue;
            }

            let id = job.id.clone();
            match self.store.call(move |db| db.mark_expired(&id)).await {
                Ok(()) => stats.expired += 1,
                Err(e) => {
                    eprintln!("[sweeper] job {}: expire update failed: {:#}", job.id, e);
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Background loop used by `serve`; external schedulers call `sweep`
    /// through the CLI instead.
    pub async fn run_interval(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(stats) if stats.scanned > 0 => {
                    eprintln!(
                        "[sweeper] expired {} of {} due jobs ({} skipped)",
                        stats.expired, stats.scanned, stats.skipped
                    );
                }
                Ok(_) => {}
                Err(e) => eprintln!("[sweeper] sweep failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryLogArchive, build_log_key, deploy_log_key};
    use crate::db::{CompletionUpdate, JobStore};
    use crate::models::{JobMetrics, JobStatus};
    use std::sync::Mutex;

    /// Worker API double that records calls and can fail specific names.
    #[derive(Default)]
    struct RecordingWorkerApi {
        deleted: Mutex<Vec<String>>,
        failing: Option<String>,
    }

    #[async_trait::async_trait]
    impl WorkerApi for RecordingWorkerApi {
        async fn delete_worker(&self, name: &str) -> Result<()> {
            if self.failing.as_deref() == Some(name) {
                anyhow::bail!("edge API returned 500");
            }
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    async fn seed_expired_job(store: &DbHandle, id: &str, archive: &MemoryLogArchive) {
        let id_owned = id.to_string();
        store
            .call(move |db| {
                db.create_job(&id_owned, "p", "m", "2025-01-01T00:00:00.000Z")?;
                db.mark_running(&id_owned, "2025-01-01T00:00:01.000Z")?;
                db.mark_completed(
                    &id_owned,
                    &CompletionUpdate {
                        completed_at: "2025-01-01T00:01:00.000Z".to_string(),
                        expires_at: "2025-01-02T00:01:00.000Z".to_string(),
                        preview_url: format!("https://nimbus-{}.workers.dev", id_owned),
                        deployed_url: format!("https://nimbus-{}.workers.dev", id_owned),
                        worker_name: format!("nimbus-{}", id_owned.trim_start_matches("job_")),
                        build_log_key: Some(build_log_key(&id_owned)),
                        deploy_log_key: Some(deploy_log_key(&id_owned)),
                        metrics: JobMetrics::default(),
                    },
                )
            })
            .await
            .unwrap();
        archive.put(&build_log_key(id), "build log").await.unwrap();
        archive.put(&deploy_log_key(id), "deploy log").await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expires_due_jobs_and_releases_resources() {
        let store = DbHandle::new(JobStore::new_in_memory().unwrap());
        let archive = Arc::new(MemoryLogArchive::new());
        let workers = Arc::new(RecordingWorkerApi::default());
        seed_expired_job(&store, "job_old00001", &archive).await;

        let sweeper = Sweeper::new(store.clone(), archive.clone(), workers.clone());
        let stats = sweeper.sweep().await.unwrap();
        assert_eq!(stats, SweepStats { scanned: 1, expired: 1, skipped: 0 });

        assert_eq!(
            workers.deleted.lock().unwrap().clone(),
            vec!["nimbus-old00001".to_string()]
        );
        assert!(archive.keys().is_empty());

        let job = store
            .call(|db| db.get_job("job_old00001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Expired);
        assert!(job.worker_name.is_none());
        // Fields other than the released resources survive.
        assert!(job.deployed_url.is_some());
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = DbHandle::new(JobStore::new_in_memory().unwrap());
        let archive = Arc::new(MemoryLogArchive::new());
        let workers = Arc::new(RecordingWorkerApi::default());
        seed_expired_job(&store, "job_old00002", &archive).await;

        let sweeper = Sweeper::new(store.clone(), archive.clone(), workers.clone());
        sweeper.sweep().await.unwrap();
        let second = sweeper.sweep().await.unwrap();

        // Second pass selects an empty set and issues no duplicate deletes.
        assert_eq!(second, SweepStats::default());
        assert_eq!(workers.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_delete_failure_skips_row_but_not_sweep() {
        let store = DbHandle::new(JobStore::new_in_memory().unwrap());
        let archive = Arc::new(MemoryLogArchive::new());
        let workers = Arc::new(RecordingWorkerApi {
            deleted: Mutex::new(Vec::new()),
            failing: Some("nimbus-bad00001".to_string()),
        });
        seed_expired_job(&store, "job_bad00001", &archive).await;
        seed_expired_job(&store, "job_ok000001", &archive).await;

        let sweeper = Sweeper::new(store.clone(), archive.clone(), workers.clone());
        let stats = sweeper.sweep().await.unwrap();
        assert_eq!(stats, SweepStats { scanned: 2, expired: 1, skipped: 1 });

        // The failed row keeps its status for the next sweep.
        let bad = store
            .call(|db| db.get_job("job_bad00001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad.status, JobStatus::Completed);
        assert!(bad.build_log_key.is_some());

        let ok = store
            .call(|db| db.get_job("job_ok000001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.status, JobStatus::Expired);
    }
}
