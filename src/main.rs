use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use phaseline::config::{CliOverrides, Config};
use phaseline::logging;
use phaseline::settings::LogFormat;
use phaseline::pipeline::IntentRequest;
use phaseline::store::{Depth, NewRun};

mod cmd;

#[derive(Parser)]
#[command(name = "phaseline")]
#[command(version, about = "Resumable multi-phase analysis pipeline")]
pub struct Cli {
    /// Path to phaseline.toml (default: .phaseline/phaseline.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides the config file and PHASELINE_DB.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: text or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run and queue its domain analysis
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        geography: Option<String>,
        #[arg(long)]
        horizon: Option<String>,
        #[arg(long)]
        objective: Option<String>,
        /// Name of a dataset the user brings (repeatable)
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Research depth: standard, deep or total
        #[arg(long, default_value = "total")]
        depth: Depth,
    },
    /// Confirm the domain analysis and start research
    Confirm {
        run: i64,
        /// Subdomain to leave out (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Show the healed state of a run
    Status {
        run: i64,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Continue a run from its durable state
    Resume { run: i64 },
    Cancel { run: i64 },
    /// Move dead-lettered jobs back to pending
    RetryDlq { run: i64 },
    /// Delete finished jobs
    Purge {
        run: i64,
        /// Retention window (default from [jobs] done_retention_hours)
        #[arg(long)]
        older_than_hours: Option<i64>,
    },
    /// Process queued jobs
    Work {
        /// Stop when no job is eligible instead of polling forever
        #[arg(long)]
        drain: bool,
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Serve the HTTP API with background workers
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        workers: Option<usize>,
        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Write a markdown report of a run
    Export {
        run: i64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Queue an HTML or text file for the run's knowledge base
    Ingest {
        run: i64,
        #[arg(long)]
        file: PathBuf,
        /// Subdomain the chunks are filed under (default: the document name)
        #[arg(long)]
        subdomain: Option<String>,
        /// Document name (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// List a run's ingested documents
    Documents { run: i64 },
    /// Answer a question from the run's knowledge base
    Query {
        run: i64,
        question: String,
        #[arg(long)]
        json: bool,
    },
    /// Turn a plain business request into a technical brief
    Translate {
        #[arg(long)]
        sector: String,
        #[arg(long)]
        geography: Option<String>,
        #[arg(long)]
        horizon: Option<String>,
        #[arg(long)]
        objective: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default phaseline.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = Config::load(
        project_dir.clone(),
        CliOverrides {
            config: cli.config.clone(),
            db: cli.db.clone(),
            verbose: cli.verbose,
            log_format: cli.log_format,
        },
    )?;
    let _log_guard = logging::init(&config.settings.logging, cli.verbose, &project_dir)?;
    for warning in config.settings.validate() {
        warn!(%warning, "configuration warning");
    }

    match cli.command {
        Commands::Create {
            user,
            subject,
            project,
            geography,
            horizon,
            objective,
            datasets,
            depth,
        } => {
            let new = NewRun {
                user_id: user,
                project_id: project,
                subject,
                geography,
                time_horizon: horizon,
                objective,
                user_datasets: datasets,
                depth,
            };
            cmd::cmd_create(&config, new).await?;
        }
        Commands::Confirm { run, exclude } => cmd::cmd_confirm(&config, run, &exclude).await?,
        Commands::Status { run, json } => cmd::cmd_status(&config, run, json).await?,
        Commands::List { user, limit } => cmd::cmd_list(&config, user, limit).await?,
        Commands::Resume { run } => cmd::cmd_resume(&config, run).await?,
        Commands::Cancel { run } => cmd::cmd_cancel(&config, run).await?,
        Commands::RetryDlq { run } => cmd::cmd_retry_dlq(&config, run).await?,
        Commands::Purge {
            run,
            older_than_hours,
        } => cmd::cmd_purge(&config, run, older_than_hours).await?,
        Commands::Work { drain, max_jobs } => cmd::cmd_work(&config, drain, max_jobs).await?,
        Commands::Serve {
            host,
            port,
            workers,
            dev,
        } => cmd::cmd_serve(&config, host, port, workers, dev).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
        Commands::Export { run, output } => {
            cmd::cmd_export(&config, run, output.as_deref()).await?
        }
        Commands::Ingest {
            run,
            file,
            subdomain,
            name,
        } => cmd::cmd_ingest(&config, run, &file, subdomain, name).await?,
        Commands::Documents { run } => cmd::cmd_documents(&config, run).await?,
        Commands::Query {
            run,
            question,
            json,
        } => cmd::cmd_query(&config, run, &question, json).await?,
        Commands::Translate {
            sector,
            geography,
            horizon,
            objective,
            json,
        } => {
            let request = IntentRequest {
                sector,
                geography,
                time_horizon: horizon,
                objective,
            };
            cmd::cmd_translate(&config, &request, json).await?
        }
    }

    Ok(())
}
