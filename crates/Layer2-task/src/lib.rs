//! # cmdgate-task
//!
//! Job lifecycle and execution for cmdgate.
//! Submitted commands are validated, persisted as jobs, approved out of band
//! and executed by a background processor.
//!
//! ## Features
//!
//! - Allow-list validation with injection, argument and directory checks
//! - Filesystem job store with status buckets and token-gated results
//! - Operation classification and adaptive polling recommendations
//! - Background processor with concurrency cap and timeout escalation
//! - Approval bridge and pump for `pending_approval` jobs
//! - Periodic expiry, archival and purge

pub mod approval;
pub mod classifier;
pub mod events;
pub mod job;
pub mod maintenance;
pub mod output;
pub mod polling;
pub mod processor;
pub mod security;
pub mod service;
pub mod state;
pub mod store;

// Jobs
pub use job::{
    DetailedError, ExecutionToken, JobId, JobOutput, JobRecord, JobRequest, JobSummary,
    JobUpdate, OperationType, PollRecommendation, ResultMetadata, StatusReport, SubmitResponse,
};
pub use state::JobStatus;

// Validation
pub use security::{SecurityValidator, ValidationResult};

// Classification & polling
pub use classifier::{classify_operation, estimate_execution_duration};
pub use polling::{
    calculate_polling_interval, create_progress_message, format_duration, should_continue_polling,
};

// Storage
pub use store::{JobFilter, JobStore, RecoveryReport, StoreConfig};

// Execution
pub use events::JobEvent;
pub use output::{OutputBuffer, OutputLine, OutputStream};
pub use processor::{ActiveJobInfo, JobProcessor, ProcessorConfig};

// Service
pub use approval::{
    apply_decision, ApprovalBridge, ApprovalDecision, ApprovalPump, ManualApprovalBridge,
    PolicyApprovalBridge, PumpReport,
};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use service::{status_report, JobService};
