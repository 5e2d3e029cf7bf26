//! Job definition and types

use crate::state::JobStatus;
use chrono::{DateTime, Utc};
use cmdgate_foundation::ErrorCategory;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Coarse classification of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    PackageInstall,
    BuildCompile,
    DockerBuild,
    TestSuite,
    Deployment,
    Database,
    #[default]
    Other,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::PackageInstall => "package_install",
            OperationType::BuildCompile => "build_compile",
            OperationType::DockerBuild => "docker_build",
            OperationType::TestSuite => "test_suite",
            OperationType::Deployment => "deployment",
            OperationType::Database => "database",
            OperationType::Other => "other",
        }
    }

    /// Operations measured in minutes rather than seconds
    pub fn is_slow(&self) -> bool {
        matches!(self, OperationType::DockerBuild | OperationType::Deployment)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability required to read a completed job's output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionToken(String);

impl ExecutionToken {
    /// 256 bits from the thread RNG, hex encoded
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for ExecutionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExecutionToken(..)")
    }
}

impl From<String> for ExecutionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Structured failure details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedError {
    pub message: String,
    pub category: ErrorCategory,
    /// OS error code name such as `ENOENT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl DetailedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
            code: None,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Build from an OS error, attaching the errno name and a remediation
    pub fn from_io(category: ErrorCategory, context: &str, err: &std::io::Error) -> Self {
        let code = os_error_code(err);
        Self {
            message: format!("{}: {}", context, err),
            category,
            code: code.map(str::to_string),
            suggestion: code.and_then(suggestion_for).map(str::to_string),
        }
    }
}

/// Map an I/O error to its errno name
pub fn os_error_code(err: &std::io::Error) -> Option<&'static str> {
    #[cfg(unix)]
    if let Some(raw) = err.raw_os_error() {
        let name = match raw {
            libc::ENOENT => Some("ENOENT"),
            libc::EACCES => Some("EACCES"),
            libc::EPERM => Some("EPERM"),
            libc::EMFILE => Some("EMFILE"),
            libc::ENFILE => Some("ENFILE"),
            libc::ENOMEM => Some("ENOMEM"),
            libc::EAGAIN => Some("EAGAIN"),
            libc::E2BIG => Some("E2BIG"),
            libc::ENOEXEC => Some("ENOEXEC"),
            libc::ENOTDIR => Some("ENOTDIR"),
            libc::ENOSPC => Some("ENOSPC"),
            _ => None,
        };
        if name.is_some() {
            return name;
        }
    }

    match err.kind() {
        std::io::ErrorKind::NotFound => Some("ENOENT"),
        std::io::ErrorKind::PermissionDenied => Some("EACCES"),
        std::io::ErrorKind::OutOfMemory => Some("ENOMEM"),
        _ => None,
    }
}

/// Remediation hint for an errno name
pub fn suggestion_for(code: &str) -> Option<&'static str> {
    match code {
        "ENOENT" => Some("Command or working directory not found; check that it is installed and on PATH"),
        "EACCES" | "EPERM" => Some("Permission denied; check file permissions and that the command is executable"),
        "EMFILE" | "ENFILE" => Some("Too many open files; lower maxConcurrentJobs or raise the file descriptor limit"),
        "ENOMEM" => Some("Out of memory; free memory or run fewer concurrent jobs"),
        "EAGAIN" => Some("Process limit reached; retry later or run fewer concurrent jobs"),
        "E2BIG" => Some("Argument list too long; pass fewer or shorter arguments"),
        "ENOEXEC" => Some("File is not a valid executable for this platform"),
        "ENOTDIR" => Some("Working directory path is not a directory"),
        "ENOSPC" => Some("Disk is full; free space in the data directory"),
        _ => None,
    }
}

/// Submission request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Requested timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Extra environment, filtered by the policy before spawn
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new(command: impl Into<String>, args: Vec<&str>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(String::from).collect(),
            ..Self::default()
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.user_description = Some(description.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Response to a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Durable record of one requested execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    // Request
    pub command: String,
    pub args: Vec<String>,
    /// Resolved, policy-validated working directory
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub requested_timeout_ms: u64,
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_description: Option<String>,
    pub estimated_duration_ms: u64,

    // Lifecycle
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,

    // Execution results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,

    // Progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,

    // Access control: present iff status == completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_token: Option<ExecutionToken>,

    // Diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_error: Option<DetailedError>,
}

impl JobRecord {
    /// Time since submission
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.submitted_at).to_std().unwrap_or_default()
    }

    /// Time spent executing so far (or in total once finished)
    pub fn execution_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some((end - start).to_std().unwrap_or_default())
    }

    pub fn requested_timeout(&self) -> Duration {
        Duration::from_millis(self.requested_timeout_ms)
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_duration_ms)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            command: self.command.clone(),
            args: self.args.clone(),
            status: self.status,
            operation_type: self.operation_type,
            session_id: self.session_id.clone(),
            submitted_at: self.submitted_at,
            last_updated: self.last_updated,
            completed_at: self.completed_at,
            exit_code: self.exit_code,
            progress_percentage: self.progress_percentage,
            error: self.error.clone(),
        }
    }

    /// Command line for display
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Listing projection of a job; never carries output or the token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub status: JobStatus,
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update merged into a record by `JobStore::update_job`.
/// `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// Refuse the update unless the job is currently in this status
    pub expected: Option<JobStatus>,
    pub decided_by: Option<String>,
    pub cancel_requested: Option<bool>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: Option<u64>,
    pub timed_out: Option<bool>,
    pub killed: Option<bool>,
    pub result_path: Option<PathBuf>,
    pub progress_percentage: Option<u8>,
    pub progress_message: Option<String>,
    pub execution_token: Option<ExecutionToken>,
    pub error: Option<String>,
    pub detailed_error: Option<DetailedError>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expected = Some(status);
        self
    }

    pub fn decided_by(mut self, who: impl Into<String>) -> Self {
        self.decided_by = Some(who.into());
        self
    }

    pub fn progress(mut self, percentage: Option<u8>, message: Option<String>) -> Self {
        self.progress_percentage = percentage;
        self.progress_message = message;
        self
    }

    /// Attach a failure; also fills the flat `error` string
    pub fn failure(mut self, detail: DetailedError) -> Self {
        self.error = Some(detail.message.clone());
        self.detailed_error = Some(detail);
        self
    }

    pub fn token(mut self, token: ExecutionToken) -> Self {
        self.execution_token = Some(token);
        self
    }
}

/// Recommendation returned with every status check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRecommendation {
    /// Absent once there is nothing left to wait for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    pub should_continue: bool,
    pub message: String,
}

/// Answer to a status check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub time_elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<u8>,
    /// Only when completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_token: Option<ExecutionToken>,
    /// Only on failure-class statuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub next_poll_recommendation: PollRecommendation,
}

/// `results/<id>/metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub job_id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub killed: bool,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Result retrieval shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub killed: bool,
    pub pid: Option<u32>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_tokens_are_unique_and_verifiable() {
        let a = ExecutionToken::generate();
        let b = ExecutionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.verify(a.as_str()));
        assert!(!a.verify(b.as_str()));
        assert!(!a.verify(""));
        assert_eq!(format!("{:?}", a), "ExecutionToken(..)");
    }

    #[test]
    fn test_detailed_error_from_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let detail = DetailedError::from_io(ErrorCategory::Spawn, "Failed to spawn", &err);
        assert_eq!(detail.code.as_deref(), Some("ENOENT"));
        assert!(detail.suggestion.unwrap().contains("PATH"));
        assert_eq!(detail.category, ErrorCategory::Spawn);
    }

    #[cfg(unix)]
    #[test]
    fn test_os_error_code_from_raw() {
        let err = std::io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(os_error_code(&err), Some("EMFILE"));
        assert!(suggestion_for("EMFILE").is_some());
    }

    #[test]
    fn test_request_serde_camel_case() {
        let json = r#"{"command":"npm","args":["install"],"timeoutMs":500,"sessionId":"s1"}"#;
        let request: JobRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.timeout_ms, Some(500));
        assert_eq!(request.session_id.as_deref(), Some("s1"));
        assert!(request.working_directory.is_none());
    }

    #[test]
    fn test_operation_type_slowness() {
        assert!(OperationType::DockerBuild.is_slow());
        assert!(OperationType::Deployment.is_slow());
        assert!(!OperationType::PackageInstall.is_slow());
    }
}
