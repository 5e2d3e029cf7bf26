//! Job store - durable job records and result artifacts
//!
//! Layout under the data directory:
//!
//! ```text
//! jobs/<status>/<id>/job.json
//! results/<id>/stdout.txt
//! results/<id>/stderr.txt
//! results/<id>/metadata.json
//! ```
//!
//! A job's directory lives in exactly one status bucket. Updates write the
//! merged record atomically inside the current bucket, then move the whole
//! directory with a single `rename`. A crash between the two steps leaves a
//! record whose content disagrees with its bucket; readers filtering by status
//! skip it and `recover` moves it where it belongs.
//!
//! Every mutation runs under an exclusive `flock` on `<root>/.lock`, so a
//! `serve` process and one-shot CLI commands on the same data directory see
//! each other's updates in order.

use crate::classifier::{classify_operation, estimate_execution_duration};
use crate::job::{
    DetailedError, JobId, JobOutput, JobRecord, JobRequest, JobSummary, JobUpdate, ResultMetadata,
};
use crate::output::OutputStream;
use crate::state::JobStatus;
use chrono::{DateTime, Utc};
use cmdgate_foundation::{Error, ErrorCategory, JsonStore, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const JOBS_DIR: &str = "jobs";
const RESULTS_DIR: &str = "results";
const STAGING_DIR: &str = ".staging";
const JOB_FILE: &str = "job.json";
const LOCK_FILE: &str = ".lock";
const METADATA_FILE: &str = "metadata.json";

/// Attempts for reads racing a relocation
const READ_ATTEMPTS: usize = 3;

/// Retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// How long completed results stay retrievable
    pub result_retention_hours: u64,
    /// How long archive rows are kept after purge
    pub archive_retention_days: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            result_retention_hours: 24,
            archive_retention_days: 7,
        }
    }
}

impl StoreConfig {
    pub fn result_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.result_retention_hours as i64)
    }

    pub fn archive_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.archive_retention_days as i64)
    }
}

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Outcome of `JobStore::recover`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Directories moved to the bucket matching their content
    pub relocated: usize,
    /// `executing` jobs whose processor is gone, now failed
    pub orphaned: usize,
    /// Directories whose record could not be read
    pub unreadable: usize,
}

/// Append-only writer for one result stream
pub struct ResultWriter {
    stream: OutputStream,
    path: PathBuf,
    file: tokio::fs::File,
    bytes: u64,
}

impl ResultWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await.map_err(|e| {
            Error::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Flush and return the total bytes written
    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        Ok(self.bytes)
    }

    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

/// Filesystem-backed job store
pub struct JobStore {
    root: PathBuf,
    config: StoreConfig,
    lock_path: PathBuf,
    /// Threads of this process queue here before taking the file lock
    local: Mutex<()>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").field("root", &self.root).finish()
    }
}

impl JobStore {
    /// Open (or create) a store under `root`
    pub fn open(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let root = root.into();
        for status in JobStatus::ALL {
            std::fs::create_dir_all(root.join(JOBS_DIR).join(status.as_str())).map_err(|e| {
                Error::Storage(format!("Failed to create job bucket {}: {}", status, e))
            })?;
        }
        std::fs::create_dir_all(root.join(JOBS_DIR).join(STAGING_DIR))?;
        std::fs::create_dir_all(root.join(RESULTS_DIR))?;

        debug!(component = "job_store", root = %root.display(), "Job store opened");
        Ok(Self {
            lock_path: root.join(LOCK_FILE),
            root,
            config,
            local: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn bucket_dir(&self, status: JobStatus) -> PathBuf {
        self.root.join(JOBS_DIR).join(status.as_str())
    }

    fn job_dir(&self, status: JobStatus, id: JobId) -> PathBuf {
        self.bucket_dir(status).join(id.to_string())
    }

    fn staging_dir(&self, id: JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(STAGING_DIR).join(id.to_string())
    }

    pub fn results_dir(&self, id: JobId) -> PathBuf {
        self.root.join(RESULTS_DIR).join(id.to_string())
    }

    /// Run `f` holding the store's write lock
    fn exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _local = self.local.lock();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                Error::Storage(format!("Failed to open {}: {}", self.lock_path.display(), e))
            })?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .write()
            .map_err(|e| Error::Storage(format!("Failed to lock job store: {}", e)))?;
        f()
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Create a `pending_approval` record for a validated request
    pub fn submit_job(
        &self,
        request: JobRequest,
        working_directory: PathBuf,
        timeout: Duration,
    ) -> Result<JobRecord> {
        let operation_type = request
            .operation_type
            .unwrap_or_else(|| classify_operation(&request.command, &request.args));
        let estimate = estimate_execution_duration(operation_type, &request.command, &request.args);
        let now = Utc::now();

        let mut record = JobRecord {
            id: JobId::new(),
            conversation_id: request.conversation_id,
            session_id: request.session_id,
            command: request.command,
            args: request.args,
            working_directory,
            env: request.env,
            requested_timeout_ms: timeout.as_millis() as u64,
            operation_type,
            user_description: request.user_description,
            estimated_duration_ms: estimate.as_millis() as u64,
            status: JobStatus::PendingApproval,
            submitted_at: now,
            last_updated: now,
            approved_at: None,
            started_at: None,
            completed_at: None,
            expires_at: None,
            decided_by: None,
            cancel_requested: false,
            pid: None,
            exit_code: None,
            execution_time_ms: None,
            timed_out: false,
            killed: false,
            result_path: None,
            progress_percentage: None,
            progress_message: None,
            execution_token: None,
            error: None,
            detailed_error: None,
        };

        // Assemble in staging, then publish with one rename
        self.exclusive(|| {
            let mut staging = self.staging_dir(record.id);
            while staging.exists() || self.locate(record.id).is_some() {
                record.id = JobId::new();
                staging = self.staging_dir(record.id);
            }
            std::fs::create_dir_all(&staging)?;
            JsonStore::new(&staging).save(JOB_FILE, &record)?;
            std::fs::rename(&staging, self.job_dir(JobStatus::PendingApproval, record.id))
                .map_err(|e| Error::Storage(format!("Failed to publish job {}: {}", record.id, e)))
        })?;

        info!(
            component = "job_store",
            operation = "submit_job",
            job_id = %record.id,
            command = %record.command,
            operation_type = %record.operation_type,
            "Job submitted"
        );
        Ok(record)
    }

    /// Bucket currently holding the job
    fn locate(&self, id: JobId) -> Option<JobStatus> {
        let name = id.to_string();
        JobStatus::ALL
            .into_iter()
            .find(|status| self.bucket_dir(*status).join(&name).is_dir())
    }

    pub fn get_job(&self, id: JobId) -> Result<JobRecord> {
        for attempt in 0..READ_ATTEMPTS {
            let Some(status) = self.locate(id) else {
                break;
            };
            match JsonStore::new(self.job_dir(status, id)).load(JOB_FILE) {
                Ok(record) => return Ok(record),
                // The directory may have moved between locate and read
                Err(e) if attempt + 1 < READ_ATTEMPTS => {
                    debug!(job_id = %id, "Retrying job read: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound(format!("Job {}", id)))
    }

    /// Full records in one status, oldest first
    pub fn list_records(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let bucket = self.bucket_dir(status);
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&bucket)? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<JobId>().ok()) else {
                continue;
            };
            match JsonStore::new(entry.path()).load::<JobRecord>(JOB_FILE) {
                // Mid-relocation records belong to their content's bucket
                Ok(record) if record.status == status => records.push(record),
                Ok(record) => {
                    debug!(job_id = %id, bucket = %status, status = %record.status, "Skipping misplaced job");
                }
                // Moved away while listing
                Err(_) if !entry.path().exists() => {}
                Err(e) => warn!(job_id = %id, "Unreadable job record: {}", e),
            }
        }
        records.sort_by_key(|r| r.submitted_at);
        Ok(records)
    }

    /// Summaries, newest submission first. `limit` keeps the newest.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let statuses: Vec<JobStatus> = match filter.status {
            Some(status) => vec![status],
            None => JobStatus::ALL.to_vec(),
        };

        let mut summaries = Vec::new();
        for status in statuses {
            summaries.extend(
                self.list_records(status)?
                    .iter()
                    .filter(|r| match &filter.session_id {
                        Some(session) => r.session_id.as_deref() == Some(session.as_str()),
                        None => true,
                    })
                    .map(JobRecord::summary),
            );
        }
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Merge `update` into the job, enforce the state machine and relocate
    pub fn update_job(&self, id: JobId, update: JobUpdate) -> Result<JobRecord> {
        self.exclusive(|| self.update_locked(id, update))
    }

    fn update_locked(&self, id: JobId, update: JobUpdate) -> Result<JobRecord> {
        let current_status = self
            .locate(id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", id)))?;
        let dir = self.job_dir(current_status, id);
        let store = JsonStore::new(&dir);
        let mut record: JobRecord = store.load(JOB_FILE)?;

        let now = Utc::now().max(record.last_updated + chrono::Duration::microseconds(1));
        let next_status = update.status.unwrap_or(record.status);
        if update.expected.is_some_and(|expected| expected != record.status) {
            return Err(Error::invalid_transition(id, record.status, next_status));
        }
        if next_status != record.status {
            if !record.status.can_transition_to(next_status) {
                return Err(Error::invalid_transition(id, record.status, next_status));
            }
            self.stamp_transition(&mut record, next_status, now);
        }
        apply_update(&mut record, update);
        record.last_updated = now;

        if record.status == JobStatus::Completed {
            if record.execution_token.is_none() {
                return Err(Error::Internal(format!(
                    "Job {} cannot complete without an execution token",
                    id
                )));
            }
        } else {
            record.execution_token = None;
        }

        store.replace(JOB_FILE, &record)?;
        if record.status != current_status {
            std::fs::rename(&dir, self.job_dir(record.status, id)).map_err(|e| {
                Error::Storage(format!(
                    "Failed to move job {} from {} to {}: {}",
                    id, current_status, record.status, e
                ))
            })?;
            debug!(
                component = "job_store",
                operation = "update_job",
                job_id = %id,
                from = %current_status,
                to = %record.status,
                "Job relocated"
            );
        }
        Ok(record)
    }

    fn stamp_transition(&self, record: &mut JobRecord, next: JobStatus, now: DateTime<Utc>) {
        match next {
            JobStatus::Approved => record.approved_at = Some(now),
            JobStatus::Executing => record.started_at = Some(now),
            _ => {}
        }
        if next.is_finished() && next != JobStatus::Expired {
            record.completed_at = Some(now);
        }
        if next == JobStatus::Completed {
            record.expires_at = Some(now + self.config.result_retention());
        }
        record.status = next;
    }

    /// Remove a job's record and results
    pub fn delete_job(&self, id: JobId) -> Result<()> {
        self.exclusive(|| match self.locate(id) {
            Some(status) => Ok(std::fs::remove_dir_all(self.job_dir(status, id))?),
            None => Ok(()),
        })?;
        self.delete_results(id)
    }

    // ========================================================================
    // Results
    // ========================================================================

    pub async fn result_writer(&self, id: JobId, stream: OutputStream) -> Result<ResultWriter> {
        let dir = self.results_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(stream.file_name());
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(ResultWriter {
            stream,
            path,
            file,
            bytes: 0,
        })
    }

    pub fn write_metadata(&self, metadata: &ResultMetadata) -> Result<()> {
        JsonStore::new(self.results_dir(metadata.job_id)).save(METADATA_FILE, metadata)
    }

    pub fn read_metadata(&self, id: JobId) -> Result<ResultMetadata> {
        JsonStore::new(self.results_dir(id))
            .load_optional(METADATA_FILE)?
            .ok_or_else(|| Error::NotFound(format!("Results for job {}", id)))
    }

    /// Reconstruct the retrieval shape from the result files alone
    pub fn read_result(&self, id: JobId) -> Result<JobOutput> {
        let metadata = self.read_metadata(id)?;
        let dir = self.results_dir(id);
        let read = |stream: OutputStream| -> Result<String> {
            match std::fs::read(dir.join(stream.file_name())) {
                Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
                Err(e) => Err(e.into()),
            }
        };
        Ok(JobOutput {
            exit_code: metadata.exit_code,
            stdout: read(OutputStream::Stdout)?,
            stderr: read(OutputStream::Stderr)?,
            execution_time_ms: metadata.execution_time_ms,
            timed_out: metadata.timed_out,
            killed: metadata.killed,
            pid: metadata.pid,
            completed_at: metadata.completed_at,
        })
    }

    /// Token-gated result retrieval
    pub fn get_result(&self, id: JobId, token: &str) -> Result<JobOutput> {
        let record = self.get_job(id)?;
        match (&record.status, &record.execution_token) {
            (JobStatus::Completed, Some(expected)) if expected.verify(token) => self.read_result(id),
            (JobStatus::Expired, _) => Err(Error::NotFound(format!("Results for job {} have expired", id))),
            (JobStatus::Completed, _) => Err(Error::Unauthorized(format!(
                "Invalid execution token for job {}",
                id
            ))),
            (status, _) => Err(Error::Unauthorized(format!(
                "Job {} has no retrievable results (status {})",
                id, status
            ))),
        }
    }

    pub fn delete_results(&self, id: JobId) -> Result<()> {
        let dir = self.results_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reconcile the store after an unclean shutdown
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = self.exclusive(|| self.reconcile_buckets())?;

        for record in self.list_records(JobStatus::Executing)? {
            let detail = DetailedError::new(
                ErrorCategory::System,
                "Processor stopped while the job was executing",
            )
            .with_suggestion("Resubmit the job");
            let update = JobUpdate::status(JobStatus::ExecutionFailed)
                .expecting(JobStatus::Executing)
                .failure(detail);
            match self.update_job(record.id, update) {
                Ok(_) => {
                    warn!(job_id = %record.id, command = %record.command, "Failed orphaned job");
                    report.orphaned += 1;
                }
                // Finished by a live processor since the listing
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if report != RecoveryReport::default() {
            info!(
                component = "job_store",
                relocated = report.relocated,
                orphaned = report.orphaned,
                unreadable = report.unreadable,
                "Recovery complete"
            );
        }
        Ok(report)
    }

    /// Drop unpublished submissions and move records into the bucket their
    /// content names. Caller holds the write lock.
    fn reconcile_buckets(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let staging = self.root.join(JOBS_DIR).join(STAGING_DIR);
        for entry in std::fs::read_dir(&staging)? {
            let path = entry?.path();
            warn!(component = "job_store", path = %path.display(), "Removing unpublished submission");
            std::fs::remove_dir_all(&path)?;
        }

        for bucket in JobStatus::ALL {
            for entry in std::fs::read_dir(self.bucket_dir(bucket))? {
                let entry = entry?;
                let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<JobId>().ok())
                else {
                    continue;
                };
                let store = JsonStore::new(entry.path());
                store.clean_temp_files()?;
                let record: JobRecord = match store.load(JOB_FILE) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(job_id = %id, "Unreadable job record during recovery: {}", e);
                        report.unreadable += 1;
                        continue;
                    }
                };
                if record.status != bucket {
                    let target = self.job_dir(record.status, id);
                    if target.exists() {
                        warn!(job_id = %id, "Duplicate job directory in {}, leaving in place", bucket);
                        continue;
                    }
                    std::fs::rename(entry.path(), target)?;
                    info!(job_id = %id, from = %bucket, to = %record.status, "Recovered misplaced job");
                    report.relocated += 1;
                }
            }
        }
        Ok(report)
    }
}

fn apply_update(record: &mut JobRecord, update: JobUpdate) {
    let JobUpdate {
        status: _,
        expected: _,
        decided_by,
        cancel_requested,
        pid,
        exit_code,
        execution_time_ms,
        timed_out,
        killed,
        result_path,
        progress_percentage,
        progress_message,
        execution_token,
        error,
        detailed_error,
    } = update;

    macro_rules! merge {
        ($($field:ident),*) => {
            $(if $field.is_some() { record.$field = $field; })*
        };
    }
    merge!(
        decided_by,
        pid,
        exit_code,
        execution_time_ms,
        result_path,
        progress_message,
        execution_token,
        error,
        detailed_error
    );

    if let Some(pct) = progress_percentage {
        record.progress_percentage = Some(pct.min(100));
    }
    if let Some(flag) = cancel_requested {
        record.cancel_requested = flag;
    }
    if let Some(flag) = timed_out {
        record.timed_out = flag;
    }
    if let Some(flag) = killed {
        record.killed = flag;
    }
}
