//! Audit entry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What was audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Validator accepted a command
    CommandAllowed,
    /// Validator rejected a command
    CommandBlocked,
    /// Approval bridge approved a job
    JobApproved,
    /// Approval bridge rejected a job
    JobRejected,
    /// Processor started a job
    JobStarted,
    /// Processor finished a job
    JobFinished,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandAllowed => "command_allowed",
            Self::CommandBlocked => "command_blocked",
            Self::JobApproved => "job_approved",
            Self::JobRejected => "job_rejected",
            Self::JobStarted => "job_started",
            Self::JobFinished => "job_finished",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Component that emitted the entry
    pub component: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, component: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            component: component.into(),
            command: command.into(),
            args: Vec::new(),
            job_id: None,
            reason: None,
            metadata: None,
        }
    }

    pub fn with_args(mut self, args: &[String]) -> Self {
        self.args = args.to_vec();
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
