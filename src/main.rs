use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use edit_worker::config::WorkerConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "edit-worker")]
#[command(version, about = "Claim-and-process worker for site edit instructions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to worker.toml. A missing file means built-in defaults.
    #[arg(short, long, global = true, default_value = "worker.toml")]
    pub config: PathBuf,

    /// Override the database path from the config file.
    #[arg(long, global = true, env = "EDIT_WORKER_DATABASE")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Claim units from the unclaimed-work stream and process their messages
    Run {
        /// Worker identity (defaults to worker.id, then $HOSTNAME)
        #[arg(long)]
        worker_id: Option<String>,

        /// Maximum units held at once
        #[arg(long)]
        max_units: Option<usize>,
    },
    /// Enqueue an instruction for a unit and announce the unit for claiming
    Submit {
        project_id: String,
        user_id: String,
        instruction: String,

        #[arg(short, long, default_value = "main")]
        thread: String,

        /// Repository to clone on first contact with the unit
        #[arg(long)]
        repo_url: Option<String>,

        #[arg(long)]
        session_id: Option<String>,
    },
    /// Inspect or manage unit claims
    Claims {
        #[command(subcommand)]
        command: ClaimsCommands,
    },
    /// Show published results, oldest first
    Results {
        #[arg(long, requires = "user_id")]
        project_id: Option<String>,

        #[arg(long, requires = "project_id")]
        user_id: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print raw result messages as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ClaimsCommands {
    /// List every claim record
    List,
    /// Force-release a unit regardless of owner
    Release { project_id: String, user_id: String },
    /// Release claims with no activity for longer than the reclaim timeout
    Reap {
        /// Override claims.reclaim_timeout_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default worker.toml
    Init,
}

fn load_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(db) = &cli.database {
        config.worker.database = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Run {
            worker_id,
            max_units,
        } => {
            cmd::cmd_run(config, &cli, worker_id.clone(), *max_units).await?;
        }
        Commands::Submit {
            project_id,
            user_id,
            instruction,
            thread,
            repo_url,
            session_id,
        } => {
            cmd::cmd_submit(
                &config,
                project_id,
                user_id,
                thread,
                instruction,
                repo_url.clone(),
                session_id.clone(),
            )
            .await?;
        }
        Commands::Claims { command } => cmd::cmd_claims(&config, command.clone())?,
        Commands::Results {
            project_id,
            user_id,
            limit,
            json,
        } => cmd::cmd_results(
            &config,
            project_id.as_deref(),
            user_id.as_deref(),
            *limit,
            *json,
        )?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
