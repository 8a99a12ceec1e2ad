//! Coordinator CLI
//!
//! A thin transport over the coordination core. `recover` runs startup
//! recovery against the JSON state store and prints what it decided;
//! `status` prints the persisted projects and pending gates; `approve` and
//! `reject` resolve a gate left pending by an earlier run.
//!
//! # Usage
//!
//! ```bash
//! coordinator --config coordinator.toml recover
//! COORDINATOR_ORACLE_URL=http://localhost:8080/v1 coordinator recover --state-path ./state
//! coordinator status --state-path ./state
//! coordinator approve gate-1234 --feedback "partial parser is fine" --state-path ./state
//! coordinator reject gate-1234 --reason "split the task" --state-path ./state
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use coordination_core::state::{JsonFileStateStore, StateStore};
use coordination_core::{Coordinator, CoordinatorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file, overridden by COORDINATOR_* environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every active project after a restart
    Recover {
        /// Directory holding the state file (overrides config)
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
    /// Print persisted project, task and gate state as JSON
    Status {
        /// Directory holding the state file (overrides config)
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
    /// Approve a pending gate
    Approve {
        gate_id: String,
        /// Guidance recorded on the gate
        #[arg(long, default_value = "")]
        feedback: String,
        /// Directory holding the state file (overrides config)
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
    /// Reject a pending gate, withdrawing its task
    Reject {
        gate_id: String,
        #[arg(long)]
        reason: String,
        /// Directory holding the state file (overrides config)
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
}

fn build(config: CoordinatorConfig) -> Result<Coordinator> {
    Coordinator::builder(config)
        .build()
        .context("Failed to build coordinator")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coordination_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        CoordinatorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Recover { state_path } => {
            if let Some(path) = state_path {
                config.state_path = path;
            }
            tracing::info!(state_path = %config.state_path.display(), "Running recovery");

            let coordinator = build(config)?;
            let outcomes = coordinator
                .recover_all()
                .await
                .context("Recovery could not read project state")?;

            println!("{}", serde_json::to_string_pretty(&outcomes)?);
            let pending = coordinator.gates().pending();
            if !pending.is_empty() {
                tracing::warn!(gates = pending.len(), "Projects waiting on human review");
            }
        }
        Command::Status { state_path } => {
            if let Some(path) = state_path {
                config.state_path = path;
            }
            let store = JsonFileStateStore::open(&config.state_path)
                .with_context(|| format!("Failed to open {}", config.state_path.display()))?;

            let projects = store.list_project_states()?;
            let mut report = Vec::with_capacity(projects.len());
            for project in projects {
                let tasks = store.tasks_for_project(&project.project_id)?;
                report.push(serde_json::json!({
                    "project": project,
                    "tasks": tasks,
                }));
            }
            let status = serde_json::json!({
                "projects": report,
                "pending_gates": store.pending_gates()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Approve {
            gate_id,
            feedback,
            state_path,
        } => {
            if let Some(path) = state_path {
                config.state_path = path;
            }
            let coordinator = build(config)?;
            let gate = coordinator
                .approve(&gate_id, &feedback)
                .await
                .with_context(|| format!("Failed to approve {}", gate_id))?;
            println!("{}", serde_json::to_string_pretty(&gate)?);
        }
        Command::Reject {
            gate_id,
            reason,
            state_path,
        } => {
            if let Some(path) = state_path {
                config.state_path = path;
            }
            let coordinator = build(config)?;
            let gate = coordinator
                .reject(&gate_id, &reason)
                .with_context(|| format!("Failed to reject {}", gate_id))?;
            println!("{}", serde_json::to_string_pretty(&gate)?);
        }
    }

    Ok(())
}
