//! CLI command implementations.

pub mod enqueue;
pub mod event;
pub mod sync;

use anyhow::{Context, Result};
use drover_config::{DatabaseConfig, SystemConfig, load_system_config, parse_system_config};
use drover_db::{MemoryStore, PgStateStore, StateStore};
use drover_scheduler::{ChannelDispatcher, Dispatcher};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Read the system configuration, applying `database_url` on top of it.
pub fn load_config(path: Option<&Path>, database_url: Option<String>) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => SystemConfig::default(),
    };

    if let Some(url) = database_url {
        let max_connections = config
            .database
            .as_ref()
            .map(|db| db.max_connections)
            .unwrap_or(10);
        config.database = Some(DatabaseConfig {
            url,
            max_connections,
        });
    }

    Ok(config)
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    match parse_system_config(&content) {
        Ok(config) => {
            println!("Configuration is valid");
            match &config.database {
                Some(_) => println!("  database: postgres"),
                None => println!("  database: in-memory"),
            }
            println!("  sync retries: {}", config.sync.retries);
            println!("  enqueue batch size: {}", config.enqueue.batch_size);
            println!(
                "  default owner limit: {} ({} overrides)",
                config.enqueue.default_owner_limit,
                config.enqueue.owner_limits.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// The store the commands run against.
///
/// With PostgreSQL, workers claim enqueued jobs from the `job_queue` table.
/// In memory, enqueued jobs are logged through a channel instead.
pub struct Backend {
    pub store: Arc<dyn StateStore>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl Backend {
    pub async fn connect(config: &SystemConfig) -> Result<Self> {
        match &config.database {
            Some(db) => {
                let pool = drover_db::create_pool(&db.url, db.max_connections)
                    .await
                    .context("Failed to connect to database")?;
                drover_db::run_migrations(&pool)
                    .await
                    .context("Failed to run migrations")?;
                info!("Connected to database");

                Ok(Self {
                    store: Arc::new(PgStateStore::new(pool)),
                    dispatcher: None,
                })
            }
            None => {
                warn!("No database configured, state is kept in memory for this run only");

                let (dispatcher, mut rx) = ChannelDispatcher::new(256);
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        info!(
                            job_id = %message.job_id,
                            repository = %message.repository_slug,
                            number = %message.number,
                            "Job ready for a worker"
                        );
                    }
                });

                Ok(Self {
                    store: Arc::new(MemoryStore::new()),
                    dispatcher: Some(Arc::new(dispatcher)),
                })
            }
        }
    }
}
