//! Job service - submission, status, results and cancellation
//!
//! The caller-facing surface. Submission validates synchronously and never
//! runs anything; execution happens in the `JobProcessor` after approval.

use crate::job::{
    DetailedError, JobId, JobOutput, JobRecord, JobRequest, JobSummary, JobUpdate, StatusReport,
    SubmitResponse,
};
use crate::polling;
use crate::security::SecurityValidator;
use crate::state::JobStatus;
use crate::store::{JobFilter, JobStore};
use chrono::{DateTime, Utc};
use cmdgate_foundation::{Error, ErrorCategory, Result};
use std::sync::Arc;
use tracing::info;

/// Entry point for submitters
#[derive(Debug, Clone)]
pub struct JobService {
    store: Arc<JobStore>,
    validator: Arc<SecurityValidator>,
}

impl JobService {
    pub fn new(store: Arc<JobStore>, validator: Arc<SecurityValidator>) -> Self {
        Self { store, validator }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn validator(&self) -> &Arc<SecurityValidator> {
        &self.validator
    }

    /// Validate and persist a request as `pending_approval`
    pub fn submit(&self, request: JobRequest) -> Result<SubmitResponse> {
        let check = self
            .validator
            .validate_command(
                &request.command,
                &request.args,
                request.working_directory.as_deref(),
            )
            .into_result()?;

        let entry = check
            .matched_policy
            .as_ref()
            .ok_or_else(|| Error::Internal("allowed command without a policy entry".to_string()))?;
        let timeout = self.validator.effective_timeout(entry, request.timeout_ms);
        let working_directory = check
            .working_directory
            .ok_or_else(|| Error::Internal("allowed command without a working directory".to_string()))?;

        let request = JobRequest {
            args: check.sanitized_args.unwrap_or(request.args),
            ..request
        };
        let record = self.store.submit_job(request, working_directory, timeout)?;

        Ok(SubmitResponse {
            job_id: record.id,
            status: record.status,
        })
    }

    pub fn job(&self, id: JobId) -> Result<JobRecord> {
        self.store.get_job(id)
    }

    /// Status with a polling recommendation
    pub fn status(&self, id: JobId) -> Result<StatusReport> {
        let record = self.store.get_job(id)?;
        Ok(status_report(&record, Utc::now()))
    }

    /// Token-gated output of a completed job
    pub fn result(&self, id: JobId, token: &str) -> Result<JobOutput> {
        self.store.get_result(id, token)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        self.store.list_jobs(filter)
    }

    /// Cancel an approved job outright, or flag an executing one for the
    /// processor. Pending jobs are rejected through the approval path instead.
    pub fn request_cancel(&self, id: JobId) -> Result<JobRecord> {
        // One retry covers a job admitted between the read and the update
        let mut attempts = 2;
        loop {
            attempts -= 1;
            let record = self.store.get_job(id)?;
            let update = match record.status {
                JobStatus::Approved => JobUpdate::status(JobStatus::Cancelled)
                    .expecting(JobStatus::Approved)
                    .failure(DetailedError::new(
                        ErrorCategory::Execution,
                        "Cancelled before execution",
                    )),
                JobStatus::Executing => JobUpdate {
                    cancel_requested: Some(true),
                    ..JobUpdate::default()
                }
                .expecting(JobStatus::Executing),
                status => {
                    return Err(Error::invalid_transition(id, status, JobStatus::Cancelled));
                }
            };

            match self.store.update_job(id, update) {
                Ok(updated) => {
                    info!(
                        component = "job_service",
                        operation = "request_cancel",
                        job_id = %id,
                        status = %updated.status,
                        "Cancellation requested"
                    );
                    return Ok(updated);
                }
                Err(Error::InvalidTransition { .. }) if attempts > 0 => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Project a record into the status shape. The token appears only for
/// completed jobs; error fields only for failure-class statuses.
pub fn status_report(record: &JobRecord, now: DateTime<Utc>) -> StatusReport {
    let failure = record.status.is_failure();
    let detail = record.detailed_error.as_ref().filter(|_| failure);

    StatusReport {
        job_id: record.id,
        status: record.status,
        submitted_at: record.submitted_at,
        last_updated: record.last_updated,
        time_elapsed_ms: record.elapsed(now).as_millis() as u64,
        progress_message: Some(polling::progress_message_at(record, now)),
        progress_percentage: record.progress_percentage,
        execution_token: record
            .execution_token
            .clone()
            .filter(|_| record.status == JobStatus::Completed),
        error: if failure { record.error.clone() } else { None },
        error_category: detail.map(|d| d.category),
        error_code: detail.and_then(|d| d.code.clone()),
        next_poll_recommendation: polling::recommend_at(record, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use cmdgate_foundation::SecurityPolicy;
    use std::time::Duration;

    fn service() -> (tempfile::TempDir, JobService) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).unwrap();

        let store = JobStore::open(dir.path().join("data"), StoreConfig::default()).unwrap();
        let validator = SecurityValidator::new(SecurityPolicy::development(&project)).unwrap();
        (dir, JobService::new(Arc::new(store), Arc::new(validator)))
    }

    #[test]
    fn test_submit_pending_with_resolved_directory() {
        let (dir, service) = service();
        let response = service
            .submit(JobRequest::new("npm", vec!["install"]).with_timeout(Duration::from_secs(90)))
            .unwrap();
        assert_eq!(response.status, JobStatus::PendingApproval);

        let record = service.job(response.job_id).unwrap();
        assert_eq!(record.requested_timeout_ms, 90_000);
        assert_eq!(
            record.working_directory,
            dir.path().join("project").canonicalize().unwrap()
        );
    }

    #[test]
    fn test_submit_rejects_unlisted_and_injection() {
        let (_dir, service) = service();
        let err = service
            .submit(JobRequest::new("rm", vec!["-rf", "/"]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = service
            .submit(JobRequest::new("echo", vec!["hi; rm -rf /"]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(service.list(&JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_capped_at_policy_maximum() {
        let (_dir, service) = service();
        let response = service
            .submit(JobRequest {
                timeout_ms: Some(u64::MAX),
                ..JobRequest::new("cargo", vec!["build"])
            })
            .unwrap();
        let record = service.job(response.job_id).unwrap();
        assert_eq!(record.requested_timeout_ms, service.validator().policy().max_timeout_ms);
    }

    #[test]
    fn test_cancel_rules() {
        let (_dir, service) = service();
        let id = service.submit(JobRequest::new("echo", vec!["x"])).unwrap().job_id;

        let err = service.request_cancel(id).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        service
            .store()
            .update_job(id, JobUpdate::status(JobStatus::Approved))
            .unwrap();
        let cancelled = service.request_cancel(id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let report = service.status(id).unwrap();
        assert_eq!(report.error.as_deref(), Some("Cancelled before execution"));
        assert_eq!(report.error_category, Some(ErrorCategory::Execution));
        assert!(!report.next_poll_recommendation.should_continue);
    }

    #[test]
    fn test_executing_cancel_sets_flag() {
        let (_dir, service) = service();
        let id = service.submit(JobRequest::new("echo", vec!["x"])).unwrap().job_id;
        let store = service.store();
        store.update_job(id, JobUpdate::status(JobStatus::Approved)).unwrap();
        store.update_job(id, JobUpdate::status(JobStatus::Executing)).unwrap();

        let record = service.request_cancel(id).unwrap();
        assert_eq!(record.status, JobStatus::Executing);
        assert!(record.cancel_requested);
    }

    #[test]
    fn test_status_hides_token_and_errors_appropriately() {
        let (_dir, service) = service();
        let id = service.submit(JobRequest::new("echo", vec!["x"])).unwrap().job_id;

        let report = service.status(id).unwrap();
        assert_eq!(report.status, JobStatus::PendingApproval);
        assert!(report.execution_token.is_none());
        assert!(report.error.is_none());
        assert!(report.next_poll_recommendation.should_continue);
        assert_eq!(report.next_poll_recommendation.interval_ms, Some(10_000));
    }
}
