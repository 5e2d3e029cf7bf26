//! Adaptive polling recommendations
//!
//! Pure functions over a `JobRecord`. The `*_at` variants take the current
//! time explicitly; the plain ones use `Utc::now()`.

use crate::job::{JobRecord, OperationType, PollRecommendation};
use crate::state::JobStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// How long the submitter should wait before checking again.
/// `None` once there is nothing left to wait for.
pub fn calculate_polling_interval(job: &JobRecord) -> Option<Duration> {
    polling_interval_at(job, Utc::now())
}

pub fn polling_interval_at(job: &JobRecord, now: DateTime<Utc>) -> Option<Duration> {
    let secs = match job.status {
        JobStatus::PendingApproval => {
            let waited = job.elapsed(now).as_secs();
            step(waited, 2 * MINUTE, 5 * MINUTE, [10, 20, 30])
        }
        JobStatus::Approved => 5,
        JobStatus::Executing => {
            let running = job
                .execution_elapsed(now)
                .unwrap_or_else(|| job.elapsed(now))
                .as_secs();
            if job.operation_type.is_slow() {
                step(
                    running,
                    10 * MINUTE,
                    30 * MINUTE,
                    [2 * MINUTE, 5 * MINUTE, 10 * MINUTE],
                )
            } else {
                step(running, MINUTE, 5 * MINUTE, [15, 30, 60])
            }
        }
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn step(elapsed: u64, first: u64, second: u64, intervals: [u64; 3]) -> u64 {
    if elapsed < first {
        intervals[0]
    } else if elapsed < second {
        intervals[1]
    } else {
        intervals[2]
    }
}

/// Ceiling on elapsed time (since submission) for a status and operation type.
/// `None` for statuses that no longer warrant polling.
pub fn max_polling_duration(status: JobStatus, operation_type: OperationType) -> Option<Duration> {
    let secs = match status {
        JobStatus::PendingApproval => 10 * MINUTE,
        JobStatus::Approved => 30 * MINUTE,
        JobStatus::Executing => match operation_type {
            OperationType::PackageInstall => 30 * MINUTE,
            OperationType::BuildCompile => HOUR,
            OperationType::DockerBuild => 4 * HOUR,
            OperationType::TestSuite => 2 * HOUR,
            OperationType::Deployment => 2 * HOUR,
            OperationType::Database => HOUR,
            OperationType::Other => HOUR,
        },
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Whether polling is still worthwhile. A pending job past its maximum is
/// eligible for `approval_timeout`.
pub fn should_continue_polling(job: &JobRecord) -> bool {
    should_continue_polling_at(job, Utc::now())
}

pub fn should_continue_polling_at(job: &JobRecord, now: DateTime<Utc>) -> bool {
    match max_polling_duration(job.status, job.operation_type) {
        Some(max) => job.elapsed(now) < max,
        None => false,
    }
}

/// Human-readable status line
pub fn create_progress_message(job: &JobRecord) -> String {
    progress_message_at(job, Utc::now())
}

pub fn progress_message_at(job: &JobRecord, now: DateTime<Utc>) -> String {
    let elapsed = format_duration(job.elapsed(now));
    match job.status {
        JobStatus::PendingApproval => format!("Waiting for approval ({} elapsed)", elapsed),
        JobStatus::Approved => format!("Approved, waiting for an execution slot ({} elapsed)", elapsed),
        JobStatus::Executing => {
            let running = job.execution_elapsed(now).unwrap_or_default();
            let mut message = job
                .progress_message
                .clone()
                .unwrap_or_else(|| format!("Running {}", job.command_line()));
            if let Some(pct) = job.progress_percentage {
                message.push_str(&format!(" ({}%)", pct));
            }
            let estimate = job.estimated_duration();
            let tail = if running < estimate {
                format!("about {} remaining", format_duration(estimate - running))
            } else {
                "taking longer than estimated".to_string()
            };
            format!("{} - {} elapsed, {}", message, format_duration(running), tail)
        }
        JobStatus::Completed => match job.execution_time_ms {
            Some(ms) => format!("Completed in {}", format_duration(Duration::from_millis(ms))),
            None => "Completed".to_string(),
        },
        JobStatus::Expired => "Results expired".to_string(),
        status => match &job.error {
            Some(error) => format!("{}: {}", status.display_name(), error),
            None => status.display_name().to_string(),
        },
    }
}

/// Bundle interval, continuation advice and message for a status report
pub fn recommend_at(job: &JobRecord, now: DateTime<Utc>) -> PollRecommendation {
    let should_continue = should_continue_polling_at(job, now);
    let interval = if should_continue {
        polling_interval_at(job, now)
    } else {
        None
    };
    PollRecommendation {
        interval_ms: interval.map(|d| d.as_millis() as u64),
        should_continue,
        message: progress_message_at(job, now),
    }
}

/// `45s`, `2m 5s`, `1h 3m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < MINUTE {
        format!("{}s", secs)
    } else if secs < HOUR {
        let (m, s) = (secs / MINUTE, secs % MINUTE);
        if s == 0 {
            format!("{}m", m)
        } else {
            format!("{}m {}s", m, s)
        }
    } else {
        let (h, m) = (secs / HOUR, (secs % HOUR) / MINUTE);
        if m == 0 {
            format!("{}h", h)
        } else {
            format!("{}h {}m", h, m)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn job(status: JobStatus, operation_type: OperationType) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: JobId::new(),
            conversation_id: None,
            session_id: None,
            command: "npm".to_string(),
            args: vec!["install".to_string()],
            working_directory: PathBuf::from("/tmp"),
            env: BTreeMap::new(),
            requested_timeout_ms: 60_000,
            operation_type,
            user_description: None,
            estimated_duration_ms: 90_000,
            status,
            submitted_at: now,
            last_updated: now,
            approved_at: None,
            started_at: None,
            completed_at: None,
            expires_at: None,
            decided_by: None,
            cancel_requested: false,
            pid: None,
            exit_code: None,
            execution_time_ms: None,
            timed_out: false,
            killed: false,
            result_path: None,
            progress_percentage: None,
            progress_message: None,
            execution_token: None,
            error: None,
            detailed_error: None,
        }
    }

    fn after(job: &JobRecord, secs: i64) -> DateTime<Utc> {
        job.submitted_at + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_pending_backoff() {
        let j = job(JobStatus::PendingApproval, OperationType::Other);
        assert_eq!(polling_interval_at(&j, after(&j, 30)), Some(Duration::from_secs(10)));
        assert_eq!(polling_interval_at(&j, after(&j, 150)), Some(Duration::from_secs(20)));
        assert_eq!(polling_interval_at(&j, after(&j, 400)), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_approved_interval() {
        let j = job(JobStatus::Approved, OperationType::DockerBuild);
        assert_eq!(polling_interval_at(&j, after(&j, 1000)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_executing_fast_and_slow() {
        let mut fast = job(JobStatus::Executing, OperationType::PackageInstall);
        fast.started_at = Some(fast.submitted_at);
        assert_eq!(polling_interval_at(&fast, after(&fast, 10)), Some(Duration::from_secs(15)));
        assert_eq!(polling_interval_at(&fast, after(&fast, 90)), Some(Duration::from_secs(30)));
        assert_eq!(polling_interval_at(&fast, after(&fast, 600)), Some(Duration::from_secs(60)));

        let mut slow = job(JobStatus::Executing, OperationType::DockerBuild);
        slow.started_at = Some(slow.submitted_at);
        assert_eq!(polling_interval_at(&slow, after(&slow, 60)), Some(Duration::from_secs(120)));
        assert_eq!(polling_interval_at(&slow, after(&slow, 900)), Some(Duration::from_secs(300)));
        assert_eq!(polling_interval_at(&slow, after(&slow, 3600)), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_terminal_has_no_interval() {
        for status in [JobStatus::Completed, JobStatus::Rejected, JobStatus::Cancelled, JobStatus::Expired] {
            let j = job(status, OperationType::Other);
            assert_eq!(polling_interval_at(&j, after(&j, 1)), None);
            assert!(!should_continue_polling_at(&j, after(&j, 1)));
        }
    }

    #[test]
    fn test_should_continue_limits() {
        let pending = job(JobStatus::PendingApproval, OperationType::Other);
        assert!(should_continue_polling_at(&pending, after(&pending, 9 * 60)));
        assert!(!should_continue_polling_at(&pending, after(&pending, 10 * 60)));

        let install = job(JobStatus::Executing, OperationType::PackageInstall);
        assert!(!should_continue_polling_at(&install, after(&install, 31 * 60)));

        let docker = job(JobStatus::Executing, OperationType::DockerBuild);
        assert!(should_continue_polling_at(&docker, after(&docker, 3 * 3600)));
        assert!(!should_continue_polling_at(&docker, after(&docker, 4 * 3600)));
    }

    #[test]
    fn test_progress_messages() {
        let mut running = job(JobStatus::Executing, OperationType::PackageInstall);
        running.started_at = Some(running.submitted_at);
        running.progress_percentage = Some(40);
        running.progress_message = Some("Installing".to_string());
        let message = progress_message_at(&running, after(&running, 30));
        assert_eq!(message, "Installing (40%) - 30s elapsed, about 1m remaining");

        let late = progress_message_at(&running, after(&running, 200));
        assert!(late.ends_with("taking longer than estimated"));

        let mut failed = job(JobStatus::ExecutionFailed, OperationType::Other);
        failed.error = Some("exit code 1".to_string());
        assert_eq!(progress_message_at(&failed, after(&failed, 5)), "Failed: exit code 1");
    }

    #[test]
    fn test_recommendation_stops_for_terminal() {
        let j = job(JobStatus::Completed, OperationType::Other);
        let rec = recommend_at(&j, after(&j, 1));
        assert!(!rec.should_continue);
        assert!(rec.interval_ms.is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(3780)), "1h 3m");
    }
}
