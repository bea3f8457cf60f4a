//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// PostgreSQL connection. Without it the in-memory store is used.
    pub database: Option<DatabaseConfig>,
    pub sync: SyncConfig,
    pub enqueue: EnqueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often a sync is retried after losing a creation race.
    pub retries: u32,
    /// Drop permissions for repositories missing from a full sync.
    pub prune_permissions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            prune_permissions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueConfig {
    /// Maximum number of jobs queued per pass.
    pub batch_size: u32,
    /// Queued plus running jobs allowed per owner unless overridden.
    pub default_owner_limit: u32,
    /// Per-owner overrides of `default_owner_limit`, keyed by owner name.
    pub owner_limits: HashMap<String, u32>,
    /// Pause between passes when running continuously.
    pub interval_ms: u64,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            default_owner_limit: 5,
            owner_limits: HashMap::new(),
            interval_ms: 1000,
        }
    }
}

impl EnqueueConfig {
    pub fn limit_for_owner(&self, owner_name: &str) -> u32 {
        self.owner_limits
            .get(owner_name)
            .copied()
            .unwrap_or(self.default_owner_limit)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                let url = get_string_prop(node, "url")
                    .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
                let max_connections =
                    get_u32_prop(node, "max-connections")?.unwrap_or(10);
                config.database = Some(DatabaseConfig {
                    url,
                    max_connections,
                });
            }
            "sync" => {
                if let Some(retries) = get_u32_prop(node, "retries")? {
                    config.sync.retries = retries;
                }
                if let Some(prune) = get_bool_prop(node, "prune-permissions") {
                    config.sync.prune_permissions = prune;
                }
            }
            "enqueue" => {
                if let Some(batch) = get_u32_prop(node, "batch-size")? {
                    if batch == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "enqueue batch-size".to_string(),
                            message: "must be at least 1".to_string(),
                        });
                    }
                    config.enqueue.batch_size = batch;
                }
                if let Some(limit) = get_u32_prop(node, "default-owner-limit")? {
                    config.enqueue.default_owner_limit = limit;
                }
                if let Some(interval) = get_u32_prop(node, "interval-ms")? {
                    config.enqueue.interval_ms = u64::from(interval);
                }
            }
            "owner" => {
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("owner name".to_string()))?;
                let limit = get_u32_prop(node, "limit")?.ok_or_else(|| {
                    ConfigError::MissingField(format!("limit for owner '{}'", name))
                })?;
                if config.enqueue.owner_limits.insert(name.clone(), limit).is_some() {
                    return Err(ConfigError::Duplicate(format!("owner '{}'", name)));
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: format!("{} {}", node.name().value(), name),
        message: message.to_string(),
    };
    let n = value
        .as_integer()
        .ok_or_else(|| invalid("expected an integer"))?;
    u32::try_from(n)
        .map(Some)
        .map_err(|_| invalid("out of range"))
}
