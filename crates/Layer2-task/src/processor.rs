//! Job processor - runs approved jobs as OS processes
//!
//! Features:
//! - Fixed-tick admission loop with a concurrency cap
//! - Process-group spawn with a sanitized environment
//! - stdout/stderr streamed to result files and an in-memory buffer
//! - Timeout escalation (SIGTERM, then SIGKILL after a grace window)
//! - Cancellation through the store and graceful shutdown

use crate::events::{JobEvent, EVENT_CAPACITY};
use crate::job::{DetailedError, ExecutionToken, JobId, JobRecord, JobUpdate, ResultMetadata};
use crate::output::{detect_progress, OutputBuffer, OutputStream, ProgressHint, DEFAULT_MAX_LINES};
use crate::polling::format_duration;
use crate::security::SecurityValidator;
use crate::state::JobStatus;
use crate::store::{JobStore, ResultWriter};
use chrono::{DateTime, Utc};
use cmdgate_foundation::{AuditAction, AuditEntry, AuditSink, ErrorCategory, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of stderr appended to failure messages
const STDERR_TAIL_LINES: usize = 5;

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorConfig {
    /// Maximum live child processes
    pub max_concurrent_jobs: usize,
    /// Admission loop period
    pub tick_interval_ms: u64,
    /// Wait between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
    /// How long shutdown waits for jobs to wind down
    pub shutdown_timeout_ms: u64,
    /// In-memory output lines kept per job
    pub max_output_lines: usize,
    /// Minimum gap between progress writes to the store
    pub progress_update_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            tick_interval_ms: 1000,
            kill_grace_ms: 5000,
            shutdown_timeout_ms: 10_000,
            max_output_lines: DEFAULT_MAX_LINES,
            progress_update_interval_ms: 1000,
        }
    }
}

impl ProcessorConfig {
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn progress_update_interval(&self) -> Duration {
        Duration::from_millis(self.progress_update_interval_ms)
    }
}

/// Why a running job was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Shutdown,
}

/// Stop request for one job. The first reason wins.
#[derive(Clone, Default)]
struct StopHandle {
    token: CancellationToken,
    reason: Arc<parking_lot::Mutex<Option<StopReason>>>,
}

impl StopHandle {
    fn request(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }
}

/// Entry in the active-process table
struct ActiveProcess {
    command: String,
    pid: Option<u32>,
    started_at: Instant,
    stop: StopHandle,
    output: Arc<Mutex<OutputBuffer>>,
}

/// Snapshot of a running job
#[derive(Debug, Clone)]
pub struct ActiveJobInfo {
    pub job_id: JobId,
    pub command: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

/// What happened to a spawned process
struct ProcessOutcome {
    pid: Option<u32>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    killed: bool,
    /// The stop token fired before the process exited
    stopped: bool,
    stdout_bytes: u64,
    stderr_bytes: u64,
}

/// Background execution engine
#[derive(Clone)]
pub struct JobProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    store: Arc<JobStore>,
    validator: Arc<SecurityValidator>,
    config: ProcessorConfig,
    /// Written only by the processor: admission, completion, shutdown
    active: RwLock<HashMap<JobId, ActiveProcess>>,
    /// Serializes admission between concurrent `tick` calls
    admission: Mutex<()>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    audit: Option<Arc<dyn AuditSink>>,
}

impl JobProcessor {
    pub fn new(store: Arc<JobStore>, validator: Arc<SecurityValidator>, config: ProcessorConfig) -> Self {
        Self::build(store, validator, config, None)
    }

    /// Create with an audit sink for start/finish records
    pub fn with_audit(
        store: Arc<JobStore>,
        validator: Arc<SecurityValidator>,
        config: ProcessorConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::build(store, validator, config, Some(audit))
    }

    fn build(
        store: Arc<JobStore>,
        validator: Arc<SecurityValidator>,
        config: ProcessorConfig,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ProcessorInner {
                store,
                validator,
                active: RwLock::new(HashMap::with_capacity(config.max_concurrent_jobs)),
                config,
                admission: Mutex::new(()),
                events,
                shutdown: CancellationToken::new(),
                audit,
            }),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Receive lifecycle events for every job
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    pub async fn active_jobs(&self) -> Vec<ActiveJobInfo> {
        self.inner
            .active
            .read()
            .await
            .iter()
            .map(|(id, p)| ActiveJobInfo {
                job_id: *id,
                command: p.command.clone(),
                pid: p.pid,
                elapsed: p.started_at.elapsed(),
            })
            .collect()
    }

    /// Last `n` captured lines of a running job
    pub async fn output_tail(&self, id: JobId, stream: OutputStream, n: usize) -> Option<Vec<String>> {
        let output = self.inner.active.read().await.get(&id)?.output.clone();
        let buffer = output.lock().await;
        Some(buffer.tail(stream, n).into_iter().map(|l| l.content.clone()).collect())
    }

    /// Ask a running job in this processor to stop. Returns false if it is
    /// not running here.
    pub async fn cancel(&self, id: JobId) -> bool {
        match self.inner.active.read().await.get(&id) {
            Some(process) => {
                process.stop.request(StopReason::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run the admission loop on a background task
    pub fn spawn(&self) -> JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move { processor.run().await })
    }

    /// Admission loop; returns once `shutdown` is called
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.inner.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            component = "job_processor",
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            tick_ms = self.inner.config.tick_interval_ms,
            "Job processor started"
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(component = "job_processor", operation = "tick", "Tick failed: {}", e);
                    }
                }
            }
        }

        debug!(component = "job_processor", "Admission loop stopped");
    }

    /// One admission pass: honour cancel requests, then start approved jobs
    /// (oldest first) while slots are free. Returns the number started.
    pub async fn tick(&self) -> Result<usize> {
        if self.is_shutting_down() {
            return Ok(0);
        }
        let _admission = self.inner.admission.lock().await;

        self.honour_cancel_requests().await?;

        let max = self.inner.config.max_concurrent_jobs;
        let mut started = 0;
        for job in self.inner.store.list_records(JobStatus::Approved)? {
            if self.inner.active.read().await.len() >= max {
                break;
            }
            if job.cancel_requested {
                let detail = DetailedError::new(ErrorCategory::Execution, "Cancelled by request");
                if let Err(e) = self
                    .inner
                    .store
                    .update_job(job.id, JobUpdate::status(JobStatus::Cancelled).failure(detail))
                {
                    warn!(job_id = %job.id, "Failed to cancel approved job: {}", e);
                }
                continue;
            }
            if self.admit(job).await {
                started += 1;
            }
        }
        Ok(started)
    }

    async fn honour_cancel_requests(&self) -> Result<()> {
        let flagged: Vec<JobId> = self
            .inner
            .store
            .list_records(JobStatus::Executing)?
            .into_iter()
            .filter(|r| r.cancel_requested)
            .map(|r| r.id)
            .collect();

        if flagged.is_empty() {
            return Ok(());
        }
        let active = self.inner.active.read().await;
        for id in flagged {
            if let Some(process) = active.get(&id) {
                if process.stop.reason().is_none() {
                    info!(component = "job_processor", job_id = %id, "Cancelling job");
                }
                process.stop.request(StopReason::Cancelled);
            }
        }
        Ok(())
    }

    /// Reserve a slot, mark the job executing and hand it to its own task
    async fn admit(&self, job: JobRecord) -> bool {
        let id = job.id;
        let stop = StopHandle::default();
        let output = Arc::new(Mutex::new(OutputBuffer::new(self.inner.config.max_output_lines)));

        self.inner.active.write().await.insert(
            id,
            ActiveProcess {
                command: job.command_line(),
                pid: None,
                started_at: Instant::now(),
                stop: stop.clone(),
                output: output.clone(),
            },
        );

        let record = match self.inner.store.update_job(id, JobUpdate::status(JobStatus::Executing)) {
            Ok(record) => record,
            Err(e) => {
                warn!(component = "job_processor", job_id = %id, "Failed to start job: {}", e);
                self.inner.active.write().await.remove(&id);
                return false;
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute_job(record, stop, output).await });
        true
    }

    /// Stop the loop, stop every active job, wait, then kill survivors
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let count = {
            let active = self.inner.active.read().await;
            for process in active.values() {
                process.stop.request(StopReason::Shutdown);
            }
            active.len()
        };
        info!(component = "job_processor", active = count, "Shutting down job processor");

        let deadline = Instant::now() + self.inner.config.shutdown_timeout();
        while !self.inner.active.read().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut active = self.inner.active.write().await;
        for (id, process) in active.iter() {
            warn!(component = "job_processor", job_id = %id, "Force killing job at shutdown");
            #[cfg(unix)]
            if let Some(pid) = process.pid {
                signal_process_group(pid, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = process;
        }
        active.clear();
    }
}

impl ProcessorInner {
    async fn execute_job(
        self: Arc<Self>,
        record: JobRecord,
        stop: StopHandle,
        output: Arc<Mutex<OutputBuffer>>,
    ) {
        let id = record.id;
        let clock = Instant::now();
        let started_at = record.started_at.unwrap_or_else(Utc::now);

        match self.run_process(&record, &stop, &output).await {
            Ok(outcome) => {
                let execution_time_ms = clock.elapsed().as_millis() as u64;
                self.finish(&record, outcome, &stop, &output, started_at, execution_time_ms)
                    .await;
            }
            Err(detail) => self.fail_to_start(&record, detail),
        }

        self.active.write().await.remove(&id);
    }

    async fn run_process(
        &self,
        record: &JobRecord,
        stop: &StopHandle,
        output: &Arc<Mutex<OutputBuffer>>,
    ) -> std::result::Result<ProcessOutcome, DetailedError> {
        let id = record.id;

        // The policy may have changed since submission
        let check = self.validator.validate_for_execution(
            &record.command,
            &record.args,
            &record.working_directory,
        );
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "command rejected".to_string());
            return Err(DetailedError::new(ErrorCategory::Validation, reason)
                .with_suggestion("The security policy no longer allows this command"));
        }
        let args = check.sanitized_args.unwrap_or_else(|| record.args.clone());
        let dir = check
            .working_directory
            .unwrap_or_else(|| record.working_directory.clone());

        let system = |e: cmdgate_foundation::Error| {
            DetailedError::new(ErrorCategory::System, format!("Failed to create result files: {}", e))
        };
        let stdout_writer = self.store.result_writer(id, OutputStream::Stdout).await.map_err(system)?;
        let stderr_writer = self.store.result_writer(id, OutputStream::Stderr).await.map_err(system)?;

        let env = self.validator.sanitize_environment(&record.env);
        let mut cmd = Command::new(&record.command);
        cmd.args(&args)
            .current_dir(&dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            DetailedError::from_io(
                ErrorCategory::Spawn,
                &format!("Failed to spawn '{}'", record.command),
                &e,
            )
        })?;
        let pid = child.id();

        if let Some(active) = self.active.write().await.get_mut(&id) {
            active.pid = pid;
        }
        let update = JobUpdate {
            pid,
            result_path: Some(self.store.results_dir(id)),
            ..JobUpdate::default()
        };
        if let Err(e) = self.store.update_job(id, update) {
            warn!(job_id = %id, "Failed to record pid: {}", e);
        }

        info!(
            component = "job_processor",
            operation = "execute_job",
            job_id = %id,
            pid = pid.unwrap_or_default(),
            command = %record.command_line(),
            timeout_ms = record.requested_timeout_ms,
            "Job started"
        );
        let _ = self.events.send(JobEvent::Started {
            job_id: id,
            pid,
            command: record.command_line(),
        });
        self.record_audit(AuditAction::JobStarted, record, None);

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressHint>(64);
        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(pump_stream(pipe, stdout_writer, output.clone(), progress_tx.clone()))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(pump_stream(pipe, stderr_writer, output.clone(), progress_tx.clone()))
        });
        drop(progress_tx);

        let grace = self.config.kill_grace();
        let deadline = Instant::now() + record.requested_timeout();
        let mut kill_at: Option<Instant> = None;
        let mut timed_out = false;
        let mut killed = false;
        let mut stop_seen = false;
        let mut progress_open = true;
        let mut progress = ProgressThrottle::new(self.config.progress_update_interval());

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,

                _ = tokio::time::sleep_until(deadline), if !timed_out && !stop_seen => {
                    warn!(job_id = %id, timeout_ms = record.requested_timeout_ms, "Job timed out, terminating");
                    timed_out = true;
                    killed = true;
                    terminate(&mut child, pid);
                    kill_at = Some(Instant::now() + grace);
                }

                _ = sleep_until_opt(kill_at), if kill_at.is_some() => {
                    warn!(job_id = %id, "Grace period expired, killing");
                    force_kill(&mut child, pid);
                    kill_at = None;
                }

                _ = stop.token.cancelled(), if !stop_seen => {
                    stop_seen = true;
                    killed = true;
                    debug!(job_id = %id, reason = ?stop.reason(), "Stop requested");
                    terminate(&mut child, pid);
                    let escalate = Instant::now() + grace;
                    kill_at = Some(kill_at.map_or(escalate, |at| at.min(escalate)));
                }

                hint = progress_rx.recv(), if progress_open => match hint {
                    Some(hint) => {
                        if let Some((percentage, message)) = progress.offer(hint) {
                            self.publish_progress(id, percentage, message);
                        }
                    }
                    None => progress_open = false,
                },
            }
        };

        let (stdout_bytes, stderr_bytes) =
            futures::future::join(drain(stdout_task, grace), drain(stderr_task, grace)).await;

        let status = status.map_err(|e| {
            DetailedError::from_io(ErrorCategory::System, "Failed to wait for process", &e)
        })?;

        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Ok(ProcessOutcome {
            pid,
            exit_code: status.code(),
            signal,
            timed_out,
            killed,
            stopped: stop_seen,
            stdout_bytes,
            stderr_bytes,
        })
    }

    fn publish_progress(&self, id: JobId, percentage: Option<u8>, message: Option<String>) {
        let update = JobUpdate::new().progress(percentage, message.clone());
        if let Err(e) = self.store.update_job(id, update) {
            debug!(job_id = %id, "Failed to store progress: {}", e);
        }
        let _ = self.events.send(JobEvent::Progress {
            job_id: id,
            percentage,
            message,
        });
    }

    async fn finish(
        &self,
        record: &JobRecord,
        outcome: ProcessOutcome,
        stop: &StopHandle,
        output: &Arc<Mutex<OutputBuffer>>,
        started_at: DateTime<Utc>,
        execution_time_ms: u64,
    ) {
        let id = record.id;
        let metadata = ResultMetadata {
            job_id: id,
            command: record.command.clone(),
            args: record.args.clone(),
            exit_code: outcome.exit_code,
            execution_time_ms,
            timed_out: outcome.timed_out,
            killed: outcome.killed,
            pid: outcome.pid,
            started_at,
            completed_at: Utc::now(),
            stdout_bytes: outcome.stdout_bytes,
            stderr_bytes: outcome.stderr_bytes,
        };
        if let Err(e) = self.store.write_metadata(&metadata) {
            error!(job_id = %id, "Failed to write result metadata: {}", e);
        }

        let mut update = JobUpdate {
            exit_code: outcome.exit_code,
            execution_time_ms: Some(execution_time_ms),
            timed_out: Some(outcome.timed_out),
            killed: Some(outcome.killed),
            ..JobUpdate::default()
        };

        // A stop that lands after exit does not override the outcome
        let stop_reason = if outcome.stopped { stop.reason() } else { None };
        let status = if let Some(reason) = stop_reason {
            let detail = match reason {
                StopReason::Cancelled => {
                    DetailedError::new(ErrorCategory::Execution, "Cancelled by request")
                }
                StopReason::Shutdown => DetailedError::new(
                    ErrorCategory::System,
                    "Processor shut down while the job was executing",
                )
                .with_suggestion("Resubmit the job"),
            };
            update = update.failure(detail);
            JobStatus::Cancelled
        } else if outcome.timed_out {
            let mut detail = DetailedError::new(
                ErrorCategory::Timeout,
                format!(
                    "Timed out after {}",
                    format_duration(record.requested_timeout())
                ),
            )
            .with_suggestion(format!(
                "Increase timeoutMs (up to {} ms) or split the work into smaller commands",
                self.validator.policy().max_timeout_ms
            ));
            detail.code = Some("ETIMEDOUT".to_string());
            update = update.failure(detail);
            JobStatus::ExecutionTimeout
        } else if outcome.exit_code == Some(0) && !outcome.killed {
            update.progress_percentage = Some(100);
            update = update.token(ExecutionToken::generate());
            JobStatus::Completed
        } else {
            let mut message = match (outcome.exit_code, outcome.signal) {
                (Some(code), _) => format!("Process exited with code {}", code),
                (None, Some(signal)) => format!("Process terminated by signal {}", signal),
                (None, None) => "Process exited abnormally".to_string(),
            };
            if let Some(tail) = output.lock().await.stderr_tail(STDERR_TAIL_LINES) {
                message = format!("{}\n{}", message, tail);
            }
            update = update.failure(DetailedError::new(ErrorCategory::Execution, message));
            JobStatus::ExecutionFailed
        };
        update.status = Some(status);

        match self.store.update_job(id, update) {
            Ok(_) => info!(
                component = "job_processor",
                operation = "execute_job",
                job_id = %id,
                status = %status,
                exit_code = ?outcome.exit_code,
                execution_time_ms,
                "Job finished"
            ),
            Err(e) => error!(job_id = %id, status = %status, "Failed to record job result: {}", e),
        }

        let _ = self.events.send(JobEvent::Finished {
            job_id: id,
            status,
            exit_code: outcome.exit_code,
            execution_time_ms,
        });
        self.record_audit(AuditAction::JobFinished, record, Some(status.as_str()));
    }

    fn fail_to_start(&self, record: &JobRecord, detail: DetailedError) {
        let id = record.id;
        error!(
            component = "job_processor",
            operation = "execute_job",
            job_id = %id,
            category = %detail.category,
            code = detail.code.as_deref().unwrap_or("-"),
            "Job failed to start: {}",
            detail.message
        );

        let update = JobUpdate::status(JobStatus::ExecutionFailed).failure(detail.clone());
        if let Err(e) = self.store.update_job(id, update) {
            error!(job_id = %id, "Failed to record spawn failure: {}", e);
        }
        let _ = self.events.send(JobEvent::SpawnFailed { job_id: id, error: detail });
        self.record_audit(
            AuditAction::JobFinished,
            record,
            Some(JobStatus::ExecutionFailed.as_str()),
        );
    }

    fn record_audit(&self, action: AuditAction, record: &JobRecord, reason: Option<&str>) {
        let Some(sink) = &self.audit else {
            return;
        };
        let mut entry = AuditEntry::new(action, "job_processor", record.command.clone())
            .with_args(&record.args)
            .with_job(record.id.to_string());
        if let Some(reason) = reason {
            entry = entry.with_reason(reason);
        }
        sink.record(&entry);
    }
}

/// Coalesces progress hints so the store sees at most one write per interval
struct ProgressThrottle {
    interval: Duration,
    last_flush: Option<Instant>,
    percentage: Option<u8>,
    message: Option<String>,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            percentage: None,
            message: None,
        }
    }

    /// Merge a hint; returns the merged progress when a write is due
    fn offer(&mut self, hint: ProgressHint) -> Option<(Option<u8>, Option<String>)> {
        if hint.percentage.is_some() {
            self.percentage = hint.percentage;
        }
        if hint.message.is_some() {
            self.message = hint.message;
        }
        let due = self
            .last_flush
            .map_or(true, |at| at.elapsed() >= self.interval);
        if !due {
            return None;
        }
        self.last_flush = Some(Instant::now());
        Some((self.percentage, self.message.clone()))
    }
}

/// Copy one pipe into its result file and the output buffer, line by line
async fn pump_stream<R>(
    pipe: R,
    mut writer: ResultWriter,
    output: Arc<Mutex<OutputBuffer>>,
    progress: mpsc::Sender<ProgressHint>,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let stream = writer.stream();
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(1024);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write(&buf).await {
                    warn!(stream = stream.as_str(), "Failed to persist output: {}", e);
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Some(hint) = detect_progress(line) {
                    let _ = progress.try_send(hint);
                }
                output.lock().await.push(stream, line, n);
            }
            Err(e) => {
                warn!(stream = stream.as_str(), "Failed to read output: {}", e);
                break;
            }
        }
    }

    let written = writer.bytes_written();
    match writer.finish().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(stream = stream.as_str(), "Failed to flush output: {}", e);
            written
        }
    }
}

/// Wait for a reader to hit EOF; abandon it after `wait`
async fn drain(task: Option<JoinHandle<u64>>, wait: Duration) -> u64 {
    let Some(mut task) = task else {
        return 0;
    };
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            0
        }
        Err(_) => {
            // A detached grandchild still holds the pipe
            task.abort();
            warn!("Output reader did not finish within {:?}", wait);
            0
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Polite stop: SIGTERM to the process group
fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        let _ = child;
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }
}

/// SIGKILL the group and the child itself
fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_process_group(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.start_kill();
}

/// Signal the process group led by `pid`, falling back to the process alone
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory we own
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}
