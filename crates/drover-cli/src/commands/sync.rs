//! Repository sync command.

use anyhow::{Context, Result};
use drover_config::SystemConfig;
use drover_core::ResourceId;
use drover_core::repository::{RemoteRepository, User};
use drover_scheduler::RepositorySynchronizer;
use std::path::Path;

use super::Backend;

/// Sync every repository listed in `path` for one user.
pub async fn run(
    backend: &Backend,
    config: &SystemConfig,
    user_id: ResourceId,
    login: String,
    path: &Path,
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read repository list: {}", path.display()))?;
    let remotes: Vec<RemoteRepository> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse repository list: {}", path.display()))?;

    let user = User { id: user_id, login };
    let synchronizer = RepositorySynchronizer::new(backend.store.clone(), config.sync.clone());
    let report = synchronizer.sync_all(&user, &remotes).await?;

    println!("Synced {} repositories for {}", report.repositories_synced, user.login);
    println!("  repositories created: {}", report.repositories_created);
    println!("  permissions created:  {}", report.permissions_created);
    println!("  permissions updated:  {}", report.permissions_updated);
    println!("  permissions removed:  {}", report.permissions_removed);

    Ok(())
}
