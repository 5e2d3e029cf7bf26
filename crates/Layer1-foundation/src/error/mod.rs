//! Error types for cmdgate
//!
//! One error enum shared by every crate in the workspace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification surfaced to callers polling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Policy violation, rejected before anything runs
    Validation,
    /// The OS could not create the process
    Spawn,
    /// The process ran and exited unsuccessfully
    Execution,
    /// The process exceeded its timeout
    Timeout,
    /// Setup or infrastructure failure (disk, store, restart)
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Spawn => "spawn",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// cmdgate error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Policy
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // ========================================================================
    // Jobs
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // Conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category reported on a job when this error ends it
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::Unauthorized(_) => ErrorCategory::Validation,
            Error::Spawn(_) => ErrorCategory::Spawn,
            Error::Execution(_) | Error::Cancelled => ErrorCategory::Execution,
            Error::Timeout(_) => ErrorCategory::Timeout,
            _ => ErrorCategory::System,
        }
    }

    /// Errors that can be shown to the submitter as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Unauthorized(_)
                | Error::NotFound(_)
                | Error::InvalidTransition { .. }
                | Error::Cancelled
        )
    }

    pub fn invalid_transition(
        job: impl std::fmt::Display,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            job: job.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            Error::Validation("x".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(Error::Spawn("x".into()).category(), ErrorCategory::Spawn);
        assert_eq!(Error::Timeout("x".into()).category(), ErrorCategory::Timeout);
        assert_eq!(Error::Storage("x".into()).category(), ErrorCategory::System);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::from(io).category(), ErrorCategory::System);
    }

    #[test]
    fn test_user_facing() {
        assert!(Error::invalid_transition("j", "completed", "approved").is_user_facing());
        assert!(!Error::System("boom".into()).is_user_facing());
    }

    #[test]
    fn test_category_serde() {
        let json = serde_json::to_string(&ErrorCategory::Spawn).unwrap();
        assert_eq!(json, "\"spawn\"");
    }
}
