//! Subcommand implementations

use crate::config::{self, ApprovalMode, GateConfig};
use anyhow::Context as _;
use chrono::Utc;
use cmdgate_foundation::{ArchiveStore, AuditSink, JsonlAuditSink, TracingAuditSink};
use cmdgate_task::{
    apply_decision, format_duration, ApprovalBridge, ApprovalDecision, ApprovalPump, JobEvent,
    JobFilter, JobId, JobProcessor, JobRequest, JobService, JobStatus, JobStore, Maintenance,
    ManualApprovalBridge, OperationType, PolicyApprovalBridge, SecurityValidator,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a subcommand needs, built from the config
pub struct Context {
    pub config: GateConfig,
    pub data_dir: PathBuf,
    pub store: Arc<JobStore>,
    pub validator: Arc<SecurityValidator>,
    pub audit: Arc<dyn AuditSink>,
    pub service: JobService,
}

impl Context {
    pub fn open(config: GateConfig) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        let store = Arc::new(
            JobStore::open(&data_dir, config.store.clone())
                .with_context(|| format!("Failed to open job store at {}", data_dir.display()))?,
        );

        let audit: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => Arc::new(JsonlAuditSink::open(path)?),
            None => Arc::new(TracingAuditSink),
        };
        let validator = Arc::new(
            SecurityValidator::new(config.policy.clone())
                .context("Invalid security policy")?
                .with_audit(audit.clone()),
        );

        Ok(Self {
            service: JobService::new(store.clone(), validator.clone()),
            config,
            data_dir,
            store,
            validator,
            audit,
        })
    }
}

// ============================================================================
// Argument parsing
// ============================================================================

pub fn parse_operation_type(s: &str) -> Result<OperationType, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown operation type '{}'", s))
}

pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

pub fn build_request(
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    timeout_ms: Option<u64>,
    operation_type: Option<OperationType>,
    description: Option<String>,
    session: Option<String>,
    env: Vec<(String, String)>,
) -> anyhow::Result<JobRequest> {
    let mut argv = argv.into_iter();
    let command = argv.next().context("No command given")?;
    Ok(JobRequest {
        command,
        args: argv.collect(),
        working_directory: cwd,
        timeout_ms,
        operation_type,
        user_description: description,
        session_id: session,
        env: env.into_iter().collect::<BTreeMap<_, _>>(),
        ..JobRequest::default()
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

pub fn init(force: bool) -> anyhow::Result<()> {
    let root = std::env::current_dir()?;
    let path = config::write_starter(&root, force)?;
    println!("✓ Created {}", path.display());
    println!("  Edit the policy, then run 'cmdgate serve'.");
    Ok(())
}

/// Processor + approval pump + maintenance until Ctrl-C
pub async fn serve(ctx: Context) -> anyhow::Result<()> {
    let recovered = ctx.store.recover()?;
    if recovered.relocated + recovered.orphaned + recovered.unreadable > 0 {
        warn!(
            relocated = recovered.relocated,
            orphaned = recovered.orphaned,
            unreadable = recovered.unreadable,
            "Recovered job store after unclean shutdown"
        );
    }

    let shutdown = CancellationToken::new();
    let processor = JobProcessor::with_audit(
        ctx.store.clone(),
        ctx.validator.clone(),
        ctx.config.processor.clone(),
        ctx.audit.clone(),
    );

    let bridge: Arc<dyn ApprovalBridge> = match ctx.config.approval {
        ApprovalMode::Policy => Arc::new(PolicyApprovalBridge::new(ctx.validator.clone())),
        ApprovalMode::Manual => Arc::new(ManualApprovalBridge),
    };
    let pump = ApprovalPump::new(ctx.store.clone(), bridge)
        .with_audit(ctx.audit.clone())
        .spawn(shutdown.clone());

    let archive = ArchiveStore::open(&ctx.data_dir)?;
    let maintenance = Maintenance::new(ctx.store.clone(), archive).spawn(
        Duration::from_secs(ctx.config.maintenance_interval_secs.max(1)),
        shutdown.clone(),
    );

    let mut events = processor.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::Progress {
                    job_id,
                    percentage,
                    message,
                }) => debug!(job_id = %job_id, ?percentage, ?message, "Progress"),
                Ok(event) => debug!(job_id = %event.job_id(), final_event = event.is_final(), "Job event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let runner = processor.spawn();
    println!(
        "cmdgate serving {} ({} concurrent jobs, {:?} approval). Press Ctrl-C to stop.",
        ctx.data_dir.display(),
        ctx.config.processor.max_concurrent_jobs,
        ctx.config.approval
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    processor.shutdown().await;
    let (runner, pump, maintenance) = futures::future::join3(runner, pump, maintenance).await;
    for (name, joined) in [("processor", runner), ("approval", pump), ("maintenance", maintenance)] {
        if let Err(e) = joined {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    event_log.abort();
    Ok(())
}

pub fn submit(ctx: &Context, request: JobRequest, json: bool) -> anyhow::Result<()> {
    let response = ctx.service.submit(request)?;
    if json {
        return print_json(&response);
    }
    println!("Submitted job {} ({})", response.job_id, response.status);
    println!("  Check with: cmdgate status {}", response.job_id);
    Ok(())
}

pub fn status(ctx: &Context, id: JobId, json: bool) -> anyhow::Result<()> {
    let report = ctx.service.status(id)?;
    if json {
        return print_json(&report);
    }

    println!("Job       {}", report.job_id);
    println!(
        "Status    {} {}",
        report.status.symbol(),
        report.status.display_name()
    );
    println!(
        "Elapsed   {}",
        format_duration(Duration::from_millis(report.time_elapsed_ms))
    );
    if let Some(message) = &report.progress_message {
        match report.progress_percentage {
            Some(pct) => println!("Progress  {} ({}%)", message, pct),
            None => println!("Progress  {}", message),
        }
    }
    if let Some(token) = &report.execution_token {
        println!("Token     {}", token.as_str());
        println!("  Fetch with: cmdgate result {} --token {}", report.job_id, token.as_str());
    }
    if let Some(error) = &report.error {
        let category = report.error_category.map(|c| c.as_str()).unwrap_or("-");
        match &report.error_code {
            Some(code) => println!("Error     [{}/{}] {}", category, code, error),
            None => println!("Error     [{}] {}", category, error),
        }
    }
    let next = &report.next_poll_recommendation;
    match next.interval_ms.filter(|_| next.should_continue) {
        Some(ms) => println!(
            "Next poll in {}",
            format_duration(Duration::from_millis(ms))
        ),
        None => println!("No further polling needed"),
    }
    Ok(())
}

pub fn result(ctx: &Context, id: JobId, token: &str, json: bool) -> anyhow::Result<()> {
    let output = ctx.service.result(id, token)?;
    if json {
        return print_json(&output);
    }
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    eprintln!(
        "-- exit code {} in {}{}",
        output
            .exit_code
            .map_or_else(|| "-".to_string(), |c| c.to_string()),
        format_duration(Duration::from_millis(output.execution_time_ms)),
        if output.timed_out { " (timed out)" } else { "" }
    );
    Ok(())
}

pub fn list(
    ctx: &Context,
    status: Option<JobStatus>,
    session: Option<String>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let filter = JobFilter {
        status,
        session_id: session,
        limit: Some(limit),
    };
    let jobs = ctx.service.list(&filter)?;
    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<10} {:<20} {:<16} {:<8} {}",
        "ID", "Status", "Type", "Age", "Command"
    );
    println!("{}", "-".repeat(80));
    for job in jobs {
        let age = (now - job.submitted_at).to_std().unwrap_or_default();
        let mut command = std::iter::once(job.command.as_str())
            .chain(job.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if command.chars().count() > 40 {
            command = format!("{}...", command.chars().take(37).collect::<String>());
        }
        println!(
            "{:<10} {:<20} {:<16} {:<8} {}",
            job.id.short(),
            format!("{} {}", job.status.symbol(), job.status),
            job.operation_type.as_str(),
            format_duration(age),
            command
        );
    }
    Ok(())
}

pub fn decide(ctx: &Context, id: JobId, decision: ApprovalDecision, by: &str) -> anyhow::Result<()> {
    let record = apply_decision(&ctx.store, id, &decision, by, Some(&*ctx.audit))?
        .context("No decision applied")?;
    println!("Job {} is now {}", record.id, record.status);
    Ok(())
}

pub fn cancel(ctx: &Context, id: JobId) -> anyhow::Result<()> {
    let record = ctx.service.request_cancel(id)?;
    if record.status == JobStatus::Cancelled {
        println!("Job {} cancelled", id);
    } else {
        println!("Cancellation requested; the processor will stop job {}", id);
    }
    Ok(())
}

pub fn validate(ctx: &Context, argv: Vec<String>, cwd: Option<PathBuf>) -> anyhow::Result<()> {
    let mut argv = argv.into_iter();
    let command = argv.next().context("No command given")?;
    let args: Vec<String> = argv.collect();

    let result = ctx
        .validator
        .validate_command(&command, &args, cwd.as_deref());
    let Some(entry) = result.matched_policy.as_ref().filter(|_| result.allowed) else {
        anyhow::bail!(
            "Blocked: {}",
            result.reason.as_deref().unwrap_or("command rejected")
        );
    };

    println!("✓ Allowed");
    if let Some(dir) = &result.working_directory {
        println!("  Directory  {}", dir.display());
    }
    println!(
        "  Timeout    {}",
        format_duration(ctx.validator.effective_timeout(entry, None))
    );
    println!(
        "  Approval   {}",
        if ctx.validator.requires_confirmation(entry) {
            "required"
        } else {
            "automatic"
        }
    );
    Ok(())
}

pub fn purge(ctx: &Context) -> anyhow::Result<()> {
    let archive = ArchiveStore::open(&ctx.data_dir)?;
    let report = Maintenance::new(ctx.store.clone(), archive).run_once()?;
    println!(
        "Expired {}, archived {}, purged {} archived rows",
        report.expired, report.archived, report.purged
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("NODE_ENV=production").unwrap(),
            ("NODE_ENV".to_string(), "production".to_string())
        );
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn test_parse_operation_type() {
        assert_eq!(
            parse_operation_type("docker_build").unwrap(),
            OperationType::DockerBuild
        );
        assert!(parse_operation_type("compile").is_err());
    }

    #[test]
    fn test_build_request() {
        let request = build_request(
            vec!["npm".into(), "run".into(), "--silent".into()],
            Some(PathBuf::from("web")),
            Some(1000),
            None,
            None,
            None,
            vec![("CI".into(), "1".into())],
        )
        .unwrap();
        assert_eq!(request.command, "npm");
        assert_eq!(request.args, vec!["run", "--silent"]);
        assert_eq!(request.env.get("CI").map(String::as_str), Some("1"));

        assert!(build_request(vec![], None, None, None, None, None, vec![]).is_err());
    }
}
