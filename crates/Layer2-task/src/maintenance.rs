//! Maintenance - result expiry, archival and purge
//!
//! - Completed jobs past `expiresAt` become `expired` and lose their results
//! - Terminal jobs idle past the result retention are archived, then deleted
//! - Archive rows older than the archive retention are purged

use crate::job::{JobRecord, JobUpdate};
use crate::state::JobStatus;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use cmdgate_foundation::{ArchiveRecord, ArchiveStore, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub archived: usize,
    pub purged: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Maintenance {
    store: Arc<JobStore>,
    archive: ArchiveStore,
}

impl Maintenance {
    pub fn new(store: Arc<JobStore>, archive: ArchiveStore) -> Self {
        Self { store, archive }
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn run_once(&self) -> Result<MaintenanceReport> {
        self.run_at(Utc::now())
    }

    /// One pass as of `now`
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let config = self.store.config();

        // 1. 만료된 결과
        for job in self.store.list_records(JobStatus::Completed)? {
            if job.expires_at.map_or(false, |at| at <= now) {
                match self.expire(&job) {
                    Ok(()) => report.expired += 1,
                    Err(e) => warn!(job_id = %job.id, "Failed to expire results: {}", e),
                }
            }
        }

        // 2. 오래된 종료 작업 아카이브
        let idle_cutoff = now - config.result_retention();
        for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for job in self.store.list_records(status)? {
                if idle_since(&job) > idle_cutoff {
                    continue;
                }
                match self.archive_job(&job, now) {
                    Ok(()) => report.archived += 1,
                    Err(e) => warn!(job_id = %job.id, "Failed to archive job: {}", e),
                }
            }
        }

        // 3. 아카이브 정리
        report.purged = self
            .archive
            .purge_older_than(now - config.archive_retention())?;

        if !report.is_empty() {
            info!(
                component = "maintenance",
                expired = report.expired,
                archived = report.archived,
                purged = report.purged,
                "Maintenance pass"
            );
        }
        Ok(report)
    }

    fn expire(&self, job: &JobRecord) -> Result<()> {
        self.store.update_job(
            job.id,
            JobUpdate::status(JobStatus::Expired).expecting(JobStatus::Completed),
        )?;
        self.store.delete_results(job.id)?;
        debug!(component = "maintenance", job_id = %job.id, "Results expired");
        Ok(())
    }

    fn archive_job(&self, job: &JobRecord, now: DateTime<Utc>) -> Result<()> {
        self.archive.insert(&ArchiveRecord {
            id: job.id.to_string(),
            command: job.command.clone(),
            args: job.args.clone(),
            status: job.status.as_str().to_string(),
            operation_type: job.operation_type.as_str().to_string(),
            exit_code: job.exit_code,
            error: job.error.clone(),
            submitted_at: job.submitted_at,
            completed_at: job.completed_at,
            archived_at: now,
        })?;
        self.store.delete_job(job.id)
    }

    /// Run a pass every `interval` until `shutdown` is cancelled
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(e) = self.run_once() {
                            warn!(component = "maintenance", "Maintenance pass failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Expired jobs idle from when their results expired, others from completion
fn idle_since(job: &JobRecord) -> DateTime<Utc> {
    let finished = match job.status {
        JobStatus::Expired => job.expires_at,
        _ => job.completed_at,
    };
    finished.unwrap_or(job.last_updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecutionToken, JobId, JobRequest, ResultMetadata};
    use crate::store::StoreConfig;

    fn setup() -> (tempfile::TempDir, Arc<JobStore>, Maintenance) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("data"), StoreConfig::default()).unwrap());
        let maintenance = Maintenance::new(store.clone(), ArchiveStore::in_memory().unwrap());
        (dir, store, maintenance)
    }

    fn completed_job(store: &JobStore) -> JobId {
        let id = store
            .submit_job(
                JobRequest::new("echo", vec!["hi"]),
                std::env::temp_dir(),
                Duration::from_secs(5),
            )
            .unwrap()
            .id;
        store.update_job(id, JobUpdate::status(JobStatus::Approved)).unwrap();
        store.update_job(id, JobUpdate::status(JobStatus::Executing)).unwrap();
        store
            .update_job(
                id,
                JobUpdate {
                    exit_code: Some(0),
                    ..JobUpdate::status(JobStatus::Completed)
                }
                .token(ExecutionToken::generate()),
            )
            .unwrap();
        let now = Utc::now();
        store
            .write_metadata(&ResultMetadata {
                job_id: id,
                command: "echo".into(),
                args: vec!["hi".into()],
                exit_code: Some(0),
                execution_time_ms: 3,
                timed_out: false,
                killed: false,
                pid: None,
                started_at: now,
                completed_at: now,
                stdout_bytes: 3,
                stderr_bytes: 0,
            })
            .unwrap();
        id
    }

    #[test]
    fn test_fresh_jobs_untouched() {
        let (_dir, store, maintenance) = setup();
        let id = completed_job(&store);

        let report = maintenance.run_once().unwrap();
        assert!(report.is_empty());
        assert_eq!(store.get_job(id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_expire_then_archive() {
        let (_dir, store, maintenance) = setup();
        let id = completed_job(&store);

        let later = Utc::now() + chrono::Duration::hours(25);
        let report = maintenance.run_at(later).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.archived, 0);

        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Expired);
        assert!(job.execution_token.is_none());
        assert!(store.read_metadata(id).is_err());

        // Expired is terminal; archived once idle past retention
        let report = maintenance.run_at(Utc::now() + chrono::Duration::hours(50)).unwrap();
        assert_eq!(report.archived, 1);
        assert!(store.get_job(id).is_err());

        let row = maintenance.archive().get(&id.to_string()).unwrap().unwrap();
        assert_eq!(row.status, "expired");
        assert_eq!(row.exit_code, Some(0));

        let report = maintenance.run_at(Utc::now() + chrono::Duration::days(60)).unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(maintenance.archive().count().unwrap(), 0);
    }
}
