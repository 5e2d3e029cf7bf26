//! cmdgate CLI - Main entry point

mod commands;
mod config;

use clap::{Parser, Subcommand};
use cmdgate_task::{JobId, JobStatus};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cmdgate - gated execution of allow-listed commands
#[derive(Parser, Debug)]
#[command(name = "cmdgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: .cmdgate/cmdgate.json, then the global config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter .cmdgate/cmdgate.json in the current directory
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Run the processor, approval pump and maintenance until Ctrl-C
    Serve,
    /// Submit a command for approval and execution
    Submit {
        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Operation type (package_install, build_compile, ...)
        #[arg(long = "type", value_parser = commands::parse_operation_type)]
        operation_type: Option<cmdgate_task::OperationType>,
        /// Description shown to approvers
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Extra environment as KEY=VALUE
        #[arg(long = "env", value_parser = commands::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Print JSON
        #[arg(long)]
        json: bool,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Show job status and the polling recommendation
    Status {
        id: JobId,
        #[arg(long)]
        json: bool,
    },
    /// Fetch the output of a completed job
    Result {
        id: JobId,
        /// Execution token from `status`
        #[arg(long)]
        token: String,
        #[arg(long)]
        json: bool,
    },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        session: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Approve a pending job
    Approve {
        id: JobId,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Reject a pending job
    Reject {
        id: JobId,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Cancel an approved or executing job
    Cancel { id: JobId },
    /// Check a command against the policy without submitting it
    Validate {
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Expire, archive and purge old jobs now
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match (&args.command, args.debug) {
        (_, true) => "debug",
        (Command::Serve, false) => "info",
        _ => "warn",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Command::Init { force } = args.command {
        return commands::init(force);
    }

    let (config, source) = config::GateConfig::load(args.config.as_deref())?;
    match &source {
        Some(path) => tracing::debug!("Using config {}", path.display()),
        None => tracing::debug!("No config file found, using defaults"),
    }
    let ctx = commands::Context::open(config)?;

    match args.command {
        Command::Init { .. } => Ok(()),
        Command::Serve => commands::serve(ctx).await,
        Command::Submit {
            cwd,
            timeout_ms,
            operation_type,
            description,
            session,
            env,
            json,
            argv,
        } => {
            let request = commands::build_request(
                argv,
                cwd,
                timeout_ms,
                operation_type,
                description,
                session,
                env,
            )?;
            commands::submit(&ctx, request, json)
        }
        Command::Status { id, json } => commands::status(&ctx, id, json),
        Command::Result { id, token, json } => commands::result(&ctx, id, &token, json),
        Command::List {
            status,
            session,
            limit,
            json,
        } => commands::list(&ctx, status, session, limit, json),
        Command::Approve { id, by } => {
            commands::decide(&ctx, id, cmdgate_task::ApprovalDecision::Approve, &by)
        }
        Command::Reject { id, reason, by } => {
            commands::decide(&ctx, id, cmdgate_task::ApprovalDecision::reject(reason), &by)
        }
        Command::Cancel { id } => commands::cancel(&ctx, id),
        Command::Validate { cwd, argv } => commands::validate(&ctx, argv, cwd),
        Command::Purge => commands::purge(&ctx),
    }
}
