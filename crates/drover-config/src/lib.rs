//! KDL configuration parsing for Drover CI.
//!
//! This crate handles parsing of the system configuration: database
//! connection, repository sync behaviour and enqueue limits.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, EnqueueConfig, SyncConfig, SystemConfig, load_system_config,
    parse_system_config,
};
