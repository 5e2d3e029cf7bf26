//! Job lifecycle events published by the processor

use crate::job::{DetailedError, JobId};
use crate::state::JobStatus;
use serde::Serialize;

/// Broadcast channel capacity
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: JobId,
        pid: Option<u32>,
        command: String,
    },
    Progress {
        job_id: JobId,
        percentage: Option<u8>,
        message: Option<String>,
    },
    Finished {
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        execution_time_ms: u64,
    },
    SpawnFailed {
        job_id: JobId,
        error: DetailedError,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Finished { job_id, .. }
            | JobEvent::SpawnFailed { job_id, .. } => *job_id,
        }
    }

    /// No further events follow for this job
    pub fn is_final(&self) -> bool {
        matches!(self, JobEvent::Finished { .. } | JobEvent::SpawnFailed { .. })
    }
}
