//! Audit - records policy decisions and job lifecycle milestones
//!
//! ```ignore
//! use cmdgate_foundation::audit::{AuditAction, AuditEntry, AuditSink, JsonlAuditSink};
//!
//! let sink = JsonlAuditSink::open("/var/lib/cmdgate/audit.jsonl")?;
//! sink.record(&AuditEntry::new(AuditAction::CommandBlocked, "security_validator", "rm")
//!     .with_reason("not whitelisted"));
//! ```

pub mod logger;
pub mod types;

pub use logger::{AuditSink, JsonlAuditSink, TracingAuditSink};
pub use types::{AuditAction, AuditEntry};
