//! Approval - pending_approval 작업 승인/거부
//!
//! An `ApprovalBridge` reviews jobs waiting in `pending_approval`; the
//! `ApprovalPump` polls the store, applies decisions and expires jobs that
//! waited too long.

use crate::job::{DetailedError, JobId, JobRecord, JobUpdate, OperationType};
use crate::polling::max_polling_duration;
use crate::security::SecurityValidator;
use crate::state::JobStatus;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::Utc;
use cmdgate_foundation::{AuditAction, AuditEntry, AuditSink, ErrorCategory, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default pump period
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// ApprovalDecision
// ============================================================================

/// Outcome of reviewing one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
    /// Leave pending; ask again on the next poll
    Defer,
}

impl ApprovalDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// ApprovalBridge - 승인 인터페이스
// ============================================================================

/// Decides whether pending jobs may run
#[async_trait]
pub trait ApprovalBridge: Send + Sync {
    /// Recorded as `decidedBy`
    fn name(&self) -> &str;

    async fn review(&self, job: &JobRecord) -> Result<ApprovalDecision>;
}

/// Approves commands whose policy entry does not require confirmation and
/// defers the rest
pub struct PolicyApprovalBridge {
    validator: Arc<SecurityValidator>,
}

impl PolicyApprovalBridge {
    pub fn new(validator: Arc<SecurityValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl ApprovalBridge for PolicyApprovalBridge {
    fn name(&self) -> &str {
        "policy"
    }

    async fn review(&self, job: &JobRecord) -> Result<ApprovalDecision> {
        let Some(entry) = self.validator.policy().find(&job.command) else {
            return Ok(ApprovalDecision::reject(format!(
                "Command '{}' is no longer whitelisted",
                job.command
            )));
        };
        if self.validator.requires_confirmation(entry) {
            Ok(ApprovalDecision::Defer)
        } else {
            Ok(ApprovalDecision::Approve)
        }
    }
}

/// Leaves every job pending for an operator
#[derive(Debug, Default)]
pub struct ManualApprovalBridge;

#[async_trait]
impl ApprovalBridge for ManualApprovalBridge {
    fn name(&self) -> &str {
        "manual"
    }

    async fn review(&self, _job: &JobRecord) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Defer)
    }
}

// ============================================================================
// Applying decisions
// ============================================================================

/// Apply a decision to a pending job. Returns the updated record, or `None`
/// for `Defer`.
pub fn apply_decision(
    store: &JobStore,
    id: JobId,
    decision: &ApprovalDecision,
    decided_by: &str,
    audit: Option<&dyn AuditSink>,
) -> Result<Option<JobRecord>> {
    let (update, action, reason) = match decision {
        ApprovalDecision::Defer => return Ok(None),
        ApprovalDecision::Approve => (
            JobUpdate::status(JobStatus::Approved),
            AuditAction::JobApproved,
            None,
        ),
        ApprovalDecision::Reject { reason } => (
            JobUpdate::status(JobStatus::Rejected).failure(DetailedError::new(
                ErrorCategory::Validation,
                format!("Rejected: {}", reason),
            )),
            AuditAction::JobRejected,
            Some(reason.as_str()),
        ),
    };

    let record = store.update_job(
        id,
        update
            .expecting(JobStatus::PendingApproval)
            .decided_by(decided_by),
    )?;

    info!(
        component = "approval",
        operation = "apply_decision",
        job_id = %id,
        status = %record.status,
        decided_by,
        "Approval decision applied"
    );

    if let Some(sink) = audit {
        let mut entry = AuditEntry::new(action, "approval", record.command.clone())
            .with_args(&record.args)
            .with_job(id.to_string());
        entry = match reason {
            Some(reason) => entry.with_reason(reason),
            None => entry.with_reason(format!("decided by {}", decided_by)),
        };
        sink.record(&entry);
    }
    Ok(Some(record))
}

// ============================================================================
// ApprovalPump - 승인 대기열 폴링
// ============================================================================

/// Counts from one pump pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub approved: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub timed_out: usize,
}

/// Feeds pending jobs to an `ApprovalBridge`
pub struct ApprovalPump {
    store: Arc<JobStore>,
    bridge: Arc<dyn ApprovalBridge>,
    audit: Option<Arc<dyn AuditSink>>,
    interval: Duration,
    max_pending: Duration,
}

impl ApprovalPump {
    pub fn new(store: Arc<JobStore>, bridge: Arc<dyn ApprovalBridge>) -> Self {
        let max_pending = max_polling_duration(JobStatus::PendingApproval, OperationType::Other)
            .unwrap_or(Duration::from_secs(600));
        Self {
            store,
            bridge,
            audit: None,
            interval: DEFAULT_PUMP_INTERVAL,
            max_pending,
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// How long a job may wait before `approval_timeout`
    pub fn with_max_pending(mut self, max_pending: Duration) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Review every pending job once, oldest first
    pub async fn poll_once(&self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        let now = Utc::now();

        for job in self.store.list_records(JobStatus::PendingApproval)? {
            if job.elapsed(now) >= self.max_pending {
                self.expire(&job);
                report.timed_out += 1;
                continue;
            }

            let decision = match self.bridge.review(&job).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(job_id = %job.id, bridge = self.bridge.name(), "Review failed: {}", e);
                    report.deferred += 1;
                    continue;
                }
            };

            match apply_decision(
                &self.store,
                job.id,
                &decision,
                self.bridge.name(),
                self.audit.as_deref(),
            ) {
                Ok(Some(record)) if record.status == JobStatus::Approved => report.approved += 1,
                Ok(Some(_)) => report.rejected += 1,
                Ok(None) => report.deferred += 1,
                // Decided elsewhere in the meantime
                Err(e) => debug!(job_id = %job.id, "Decision not applied: {}", e),
            }
        }
        Ok(report)
    }

    fn expire(&self, job: &JobRecord) {
        let detail = DetailedError::new(
            ErrorCategory::Timeout,
            format!(
                "Not approved within {}",
                crate::polling::format_duration(self.max_pending)
            ),
        )
        .with_suggestion("Resubmit the command and approve it sooner");
        let update = JobUpdate::status(JobStatus::ApprovalTimeout)
            .expecting(JobStatus::PendingApproval)
            .decided_by("approval_pump")
            .failure(detail);

        match self.store.update_job(job.id, update) {
            Ok(_) => info!(component = "approval", job_id = %job.id, "Approval timed out"),
            Err(e) => debug!(job_id = %job.id, "Approval timeout not applied: {}", e),
        }
    }

    /// Poll on a background task until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match self.poll_once().await {
                            Ok(report) if report != PumpReport::default() => {
                                debug!(component = "approval", ?report, "Approval pass");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(component = "approval", "Approval pass failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use crate::store::StoreConfig;
    use cmdgate_foundation::{CommandPolicy, SecurityPolicy};

    fn setup() -> (tempfile::TempDir, Arc<JobStore>, Arc<SecurityValidator>) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("data"), StoreConfig::default()).unwrap();
        let policy = SecurityPolicy::new()
            .allow(CommandPolicy::new("echo").with_confirmation(false))
            .allow(CommandPolicy::new("npm"));
        let validator = SecurityValidator::new(policy).unwrap();
        (dir, Arc::new(store), Arc::new(validator))
    }

    fn submit(store: &JobStore, command: &str) -> JobId {
        store
            .submit_job(
                JobRequest::new(command, vec![]),
                std::env::temp_dir(),
                Duration::from_secs(5),
            )
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_policy_bridge_approves_unconfirmed_only() {
        let (_dir, store, validator) = setup();
        let echo = submit(&store, "echo");
        let npm = submit(&store, "npm");

        let pump = ApprovalPump::new(store.clone(), Arc::new(PolicyApprovalBridge::new(validator)));
        let report = pump.poll_once().await.unwrap();
        assert_eq!(report.approved, 1);
        assert_eq!(report.deferred, 1);

        let echo = store.get_job(echo).unwrap();
        assert_eq!(echo.status, JobStatus::Approved);
        assert_eq!(echo.decided_by.as_deref(), Some("policy"));
        assert!(echo.approved_at.is_some());
        assert_eq!(store.get_job(npm).unwrap().status, JobStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_pump_expires_stale_jobs() {
        let (_dir, store, _validator) = setup();
        let id = submit(&store, "npm");

        let pump = ApprovalPump::new(store.clone(), Arc::new(ManualApprovalBridge))
            .with_max_pending(Duration::ZERO);
        let report = pump.poll_once().await.unwrap();
        assert_eq!(report.timed_out, 1);

        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::ApprovalTimeout);
        assert_eq!(
            job.detailed_error.map(|d| d.category),
            Some(ErrorCategory::Timeout)
        );
    }

    #[test]
    fn test_reject_and_double_decision() {
        let (_dir, store, _validator) = setup();
        let id = submit(&store, "npm");

        let record = apply_decision(&store, id, &ApprovalDecision::reject("not today"), "alice", None)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Rejected);
        assert_eq!(record.error.as_deref(), Some("Rejected: not today"));

        assert!(apply_decision(&store, id, &ApprovalDecision::Approve, "bob", None).is_err());
        assert!(apply_decision(&store, id, &ApprovalDecision::Defer, "bob", None)
            .unwrap()
            .is_none());
    }
}
