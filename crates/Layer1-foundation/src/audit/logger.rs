//! Audit sinks
//!
//! Components receive an `Arc<dyn AuditSink>` at construction time; there is
//! no global audit logger.

use super::types::AuditEntry;
use crate::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Destination for audit entries. Recording never fails the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Emits audit entries as `tracing` events
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        info!(
            target: "cmdgate::audit",
            component = %entry.component,
            action = %entry.action,
            command = %entry.command,
            args = ?entry.args,
            job_id = entry.job_id.as_deref().unwrap_or("-"),
            reason = entry.reason.as_deref().unwrap_or("-"),
            "audit"
        );
    }
}

/// Appends audit entries to a JSON-lines file
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit entry: {}", e);
                return;
            }
        };
        let Ok(mut file) = self.file.lock() else {
            warn!("Audit file lock poisoned");
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(path = %self.path.display(), "Failed to write audit entry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::open(dir.path().join("logs").join("audit.jsonl")).unwrap();

        sink.record(
            &AuditEntry::new(AuditAction::CommandBlocked, "security_validator", "rm")
                .with_args(&["-rf".to_string(), "/".to_string()])
                .with_reason("not whitelisted"),
        );
        sink.record(&AuditEntry::new(AuditAction::CommandAllowed, "security_validator", "echo"));

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, AuditAction::CommandBlocked);
        assert_eq!(first.reason.as_deref(), Some("not whitelisted"));
    }
}
