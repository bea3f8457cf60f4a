//! Drover CLI tool.

use clap::{Parser, Subcommand};
use drover_core::ResourceId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Drover CI backend", long_about = None)]
struct Cli {
    /// System configuration file (KDL)
    #[arg(long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a user's repositories and permissions from a provider listing
    Sync {
        /// User ID
        #[arg(long)]
        user_id: ResourceId,
        /// User login on the provider
        #[arg(long)]
        login: String,
        /// JSON file with the provider's repository list
        repositories: PathBuf,
    },
    /// Apply a worker event to a job
    Event {
        /// Event name, e.g. job:started or job:finished
        kind: String,
        /// JSON file with the worker payload
        payload: PathBuf,
    },
    /// Enqueue runnable jobs
    Enqueue {
        /// Keep enqueueing until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "drover.kdl")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let config = commands::load_config(cli.config.as_deref(), cli.database_url)?;
    let backend = commands::Backend::connect(&config).await?;

    match cli.command {
        Commands::Sync {
            user_id,
            login,
            repositories,
        } => {
            commands::sync::run(&backend, &config, user_id, login, &repositories).await?;
        }
        Commands::Event { kind, payload } => {
            commands::event::run(&backend, &kind, &payload).await?;
        }
        Commands::Enqueue { watch } => {
            commands::enqueue::run(&backend, &config, watch).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
