//! # cmdgate-foundation
//!
//! Foundation layer for cmdgate:
//! - Error: workspace-wide error type and error categories
//! - Config: security policy (command allow-list, directory and env rules)
//! - Storage: JsonStore (atomic JSON documents), ArchiveStore (SQLite)
//! - Audit: audit entries and sinks

pub mod audit;
pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorCategory, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    CommandPolicy, DirectoryRestriction, SecurityPolicy, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{ArchiveRecord, ArchiveStore, JsonStore, ARCHIVE_DB, CONFIG_DIR};

// ============================================================================
// Audit
// ============================================================================
pub use audit::{AuditAction, AuditEntry, AuditSink, JsonlAuditSink, TracingAuditSink};
