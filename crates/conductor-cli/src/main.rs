//! `conductor`: run and control durable agent workflows from the shell.

mod commands;
mod config;
mod exit_codes;

use clap::{Parser, Subcommand};
use commands::{Context, Control, StartTarget};
use conductor_core::{ConductorError, ParamValue, WorkflowStatus, WorkflowType};
use config::ConductorConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Conductor: durable multi-step agent workflows with provider failover"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and run a workflow, or run an existing pending/orphaned one
    Start {
        /// Workflow template (delivery_pipeline, code_review, security_audit, bug_fix)
        #[arg(long = "type", value_name = "TYPE", required_unless_present = "id")]
        workflow_type: Option<WorkflowType>,
        /// Request text driving the workflow
        #[arg(long, required_unless_present = "id")]
        request: Option<String>,
        /// Project the request belongs to
        #[arg(long)]
        project: Option<String>,
        /// Extra parameter, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = commands::parse_param)]
        params: Vec<(String, ParamValue)>,
        /// Run an existing workflow instead of creating one
        #[arg(long, conflicts_with_all = ["workflow_type", "request", "project", "params"])]
        id: Option<Uuid>,
    },
    /// Show a workflow and its steps
    Status {
        id: Uuid,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Pause a running workflow at its next step boundary
    Pause { id: Uuid },
    /// Resume a paused workflow
    Resume { id: Uuid },
    /// Cancel a workflow
    Cancel { id: Uuid },
    /// List active workflows
    List {
        /// Only workflows in this status
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },
    /// Finished workflows, newest first
    History {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Recent alerts
    Alerts {
        /// Only alerts for this workflow
        #[arg(long)]
        workflow: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Provider health scores
    Providers,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit_codes::USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Provider keys may live in .env.
    let _ = dotenvy::dotenv();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_codes::for_error(&e))
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = ConductorConfig::load(&cli.config)?;
    let ctx = Context::open(config).await?;

    match cli.command {
        Commands::Start {
            workflow_type,
            request,
            project,
            params,
            id,
        } => {
            let target = match (id, workflow_type, request) {
                (Some(id), _, _) => StartTarget::Existing(id),
                (None, Some(workflow_type), Some(request)) => StartTarget::New {
                    workflow_type,
                    request,
                    project,
                    params,
                },
                _ => {
                    return Err(ConductorError::Validation(
                        "start needs --type and --request, or --id".into(),
                    )
                    .into())
                }
            };
            commands::start(&ctx, target).await
        }
        Commands::Status { id, json } => commands::status(&ctx, id, json).await,
        Commands::Pause { id } => commands::control(&ctx, id, Control::Pause).await,
        Commands::Resume { id } => commands::control(&ctx, id, Control::Resume).await,
        Commands::Cancel { id } => commands::control(&ctx, id, Control::Cancel).await,
        Commands::List { status } => commands::list(&ctx, status).await,
        Commands::History { page, page_size } => commands::history(&ctx, page, page_size).await,
        Commands::Alerts { workflow, limit } => commands::alerts(&ctx, workflow, limit).await,
        Commands::Providers => commands::providers(&ctx).await,
    }
}
