//! tailtune CLI: run hyperparameter studies and single training runs, and
//! inspect their checkpoints.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tailtune_ml::training::Slot;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// tailtune: long-tail classification training orchestrator
#[derive(Parser, Debug)]
#[command(name = "tailtune", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (settings, runs and tracking paths resolve against it)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Settings file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a hyperparameter study
    RunSearch {
        /// Search config (TOML or JSON)
        #[arg(long)]
        search_config: PathBuf,
        /// Override `study.n_trials`
        #[arg(long)]
        n_trials: Option<usize>,
        /// Experiment name (defaults to `study.name`, then the config file stem)
        #[arg(long)]
        experiment: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Train a single configuration, resuming it if a checkpoint exists
    RunTraining {
        /// Run config (TOML or JSON)
        #[arg(long)]
        run_config: PathBuf,
        #[arg(long, default_value = "default")]
        experiment: String,
        /// Override the `epochs` param, e.g. to retrain a study's best config in full
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Show what a run's checkpoint contains
    InspectCheckpoint {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        run_id: String,
        /// Checkpoint slot: last or best
        #[arg(long, default_value = "last")]
        slot: Slot,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write example config files
    InitConfig {
        #[command(subcommand)]
        template: Template,
    },
}

#[derive(clap::Subcommand, Debug, Clone, Copy)]
pub enum Template {
    /// Example search config (`search.toml`)
    Search,
    /// Example run config (`run.toml`)
    Run,
    /// Default settings (`.tailtune/config.toml`)
    Settings,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());
    let settings = tailtune_core::load_settings(Some(&workspace), cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = settings
        .paths
        .log_dir
        .as_ref()
        .map(|dir| tailtune_core::config::resolve_path(&workspace, dir))
        .or_else(|| {
            directories::ProjectDirs::from("dev", "tailtune", "tailtune")
                .map(|d| d.data_dir().join("logs"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tailtune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &workspace, &settings)
}
