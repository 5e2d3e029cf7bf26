//! Job state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job
///
/// ```text
/// pending_approval ─┬─► approved ─┬─► executing ─┬─► completed ─► expired
///                   ├─► rejected  └─► cancelled  ├─► execution_failed
///                   └─► approval_timeout         ├─► execution_timeout
///                                                └─► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the approval bridge
    PendingApproval,
    /// Approved, waiting for an execution slot
    Approved,
    /// Rejected by the approval bridge
    Rejected,
    /// Nobody decided in time
    ApprovalTimeout,
    /// Process is running
    Executing,
    /// Process exited successfully; results retrievable with the token
    Completed,
    /// Spawn failure or non-zero exit
    ExecutionFailed,
    /// Exceeded the requested timeout
    ExecutionTimeout,
    /// Cancelled before or during execution
    Cancelled,
    /// Results retention elapsed
    Expired,
}

impl JobStatus {
    /// Every status, in lifecycle order. Also the set of bucket directories.
    pub const ALL: [JobStatus; 10] = [
        JobStatus::PendingApproval,
        JobStatus::Approved,
        JobStatus::Rejected,
        JobStatus::ApprovalTimeout,
        JobStatus::Executing,
        JobStatus::Completed,
        JobStatus::ExecutionFailed,
        JobStatus::ExecutionTimeout,
        JobStatus::Cancelled,
        JobStatus::Expired,
    ];

    /// Stable snake_case name, used for bucket directories
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingApproval => "pending_approval",
            JobStatus::Approved => "approved",
            JobStatus::Rejected => "rejected",
            JobStatus::ApprovalTimeout => "approval_timeout",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::ExecutionFailed => "execution_failed",
            JobStatus::ExecutionTimeout => "execution_timeout",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Allowed successor states
    pub fn successors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::PendingApproval => &[
                JobStatus::Approved,
                JobStatus::Rejected,
                JobStatus::ApprovalTimeout,
            ],
            JobStatus::Approved => &[JobStatus::Executing, JobStatus::Cancelled],
            JobStatus::Executing => &[
                JobStatus::Completed,
                JobStatus::ExecutionFailed,
                JobStatus::ExecutionTimeout,
                JobStatus::Cancelled,
            ],
            JobStatus::Completed => &[JobStatus::Expired],
            _ => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.successors().contains(&next)
    }

    /// No further transitions. `completed` is not terminal: it expires.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Finished in any way, including `completed`
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed) || self.is_terminal()
    }

    /// Statuses that carry an error for the submitter
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::Rejected
                | JobStatus::ApprovalTimeout
                | JobStatus::ExecutionFailed
                | JobStatus::ExecutionTimeout
                | JobStatus::Cancelled
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobStatus::PendingApproval => "Pending approval",
            JobStatus::Approved => "Approved",
            JobStatus::Rejected => "Rejected",
            JobStatus::ApprovalTimeout => "Approval timed out",
            JobStatus::Executing => "Executing",
            JobStatus::Completed => "Completed",
            JobStatus::ExecutionFailed => "Failed",
            JobStatus::ExecutionTimeout => "Timed out",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Expired => "Expired",
        }
    }

    /// Symbol for terminal listings
    pub fn symbol(&self) -> &'static str {
        match self {
            JobStatus::PendingApproval => "◯",
            JobStatus::Approved => "◎",
            JobStatus::Executing => "⟳",
            JobStatus::Completed => "✓",
            JobStatus::ExecutionFailed | JobStatus::Rejected => "✗",
            JobStatus::ExecutionTimeout | JobStatus::ApprovalTimeout => "⏱",
            JobStatus::Cancelled => "⊘",
            JobStatus::Expired => "·",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(status: JobStatus) -> u8 {
        match status {
            JobStatus::PendingApproval => 0,
            JobStatus::Approved | JobStatus::Rejected | JobStatus::ApprovalTimeout => 1,
            JobStatus::Executing => 2,
            JobStatus::Completed
            | JobStatus::ExecutionFailed
            | JobStatus::ExecutionTimeout
            | JobStatus::Cancelled => 3,
            JobStatus::Expired => 4,
        }
    }

    #[test]
    fn test_transitions_never_move_backward() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if from.can_transition_to(to) {
                    assert!(
                        phase(to) > phase(from),
                        "{} -> {} moves backward",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for status in JobStatus::ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = JobStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Rejected,
                JobStatus::ApprovalTimeout,
                JobStatus::ExecutionFailed,
                JobStatus::ExecutionTimeout,
                JobStatus::Cancelled,
                JobStatus::Expired,
            ]
        );
        assert!(!JobStatus::Completed.is_terminal());
        assert!(JobStatus::Completed.is_finished());
    }

    #[test]
    fn test_specific_edges() {
        assert!(JobStatus::PendingApproval.can_transition_to(JobStatus::Approved));
        assert!(!JobStatus::PendingApproval.can_transition_to(JobStatus::Executing));
        assert!(!JobStatus::PendingApproval.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Approved.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Expired));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::ExecutionFailed));
    }

    #[test]
    fn test_serde_and_parse_agree() {
        for status in JobStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }
}
