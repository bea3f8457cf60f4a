//! Repository Synchronizer.
//!
//! Mirrors the repositories a user can see on the source-control provider,
//! together with the user's permission flags on each of them.

use chrono::Utc;
use drover_config::SyncConfig;
use drover_core::ResourceId;
use drover_core::repository::{
    NewRepository, Owner, Permission, RemoteRepository, Repository, User,
};
use drover_db::{DbError, DbResult, StateStore, StoreTx};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::{SchedulerError, SchedulerResult};

/// What a sync did to the permission row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub repository: Repository,
    pub permission: Permission,
    pub repository_created: bool,
    pub permission_change: PermissionChange,
}

/// Totals for a full sync of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub repositories_synced: usize,
    pub repositories_created: usize,
    pub permissions_created: usize,
    pub permissions_updated: usize,
    pub permissions_removed: usize,
}

pub struct RepositorySynchronizer {
    store: Arc<dyn StateStore>,
    config: SyncConfig,
}

impl RepositorySynchronizer {
    pub fn new(store: Arc<dyn StateStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Ensure the repository and the user's permission on it exist.
    ///
    /// Safe to run concurrently for the same repository: a lost creation
    /// race re-reads the winner's row, and the whole transaction is retried
    /// up to `retries` times if that is not enough.
    #[instrument(skip(self, user, remote), fields(user = %user.login, repository = %remote.slug()))]
    pub async fn sync(
        &self,
        user: &User,
        remote: &RemoteRepository,
    ) -> SchedulerResult<SyncOutcome> {
        let mut attempt = 0;
        loop {
            let mut tx = self.store.begin().await?;
            match sync_in(tx.as_mut(), user, remote).await {
                Ok(outcome) => {
                    tx.commit().await?;
                    if outcome.repository_created {
                        info!(repository_id = %outcome.repository.id, "Created repository");
                    }
                    debug!(permission = ?outcome.permission_change, "Synced repository");
                    return Ok(outcome);
                }
                Err(DbError::Duplicate(msg)) if attempt < self.config.retries => {
                    attempt += 1;
                    debug!(attempt, conflict = %msg, "Retrying sync after conflict");
                }
                Err(DbError::Duplicate(msg)) => {
                    return Err(SchedulerError::Conflict(format!(
                        "{} after {} retries",
                        msg, self.config.retries
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sync every repository of `remotes`, in order.
    ///
    /// With `prune_permissions` set, the user's permissions on repositories
    /// missing from `remotes` are removed afterwards.
    #[instrument(skip(self, user, remotes), fields(user = %user.login, count = remotes.len()))]
    pub async fn sync_all(
        &self,
        user: &User,
        remotes: &[RemoteRepository],
    ) -> SchedulerResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();

        for remote in remotes {
            let outcome = self.sync(user, remote).await?;
            seen.insert(outcome.repository.id);
            report.repositories_synced += 1;
            if outcome.repository_created {
                report.repositories_created += 1;
            }
            match outcome.permission_change {
                PermissionChange::Created => report.permissions_created += 1,
                PermissionChange::Updated => report.permissions_updated += 1,
                PermissionChange::Unchanged => {}
            }
        }

        if self.config.prune_permissions {
            report.permissions_removed = self.prune(user.id, &seen).await?;
        }

        info!(
            created = report.repositories_created,
            permissions_created = report.permissions_created,
            permissions_updated = report.permissions_updated,
            permissions_removed = report.permissions_removed,
            "Finished repository sync"
        );
        Ok(report)
    }

    async fn prune(&self, user_id: ResourceId, keep: &HashSet<ResourceId>) -> SchedulerResult<usize> {
        let mut tx = self.store.begin().await?;
        let mut removed = 0;
        for permission in tx.permissions_for_user(user_id).await? {
            if !keep.contains(&permission.repository_id) {
                tx.delete_permission(permission.id).await?;
                debug!(repository_id = %permission.repository_id, "Removed permission");
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }
}

async fn sync_in(
    tx: &mut dyn StoreTx,
    user: &User,
    remote: &RemoteRepository,
) -> DbResult<SyncOutcome> {
    let (repository, repository_created) = ensure_repository(tx, user, remote).await?;
    let (permission, permission_change) = ensure_permission(tx, user, &repository, remote).await?;
    Ok(SyncOutcome {
        repository,
        permission,
        repository_created,
        permission_change,
    })
}

async fn ensure_repository(
    tx: &mut dyn StoreTx,
    user: &User,
    remote: &RemoteRepository,
) -> DbResult<(Repository, bool)> {
    let owner_name = remote.owner.login.as_str();
    if let Some(existing) = tx.find_repository_by_slug(owner_name, &remote.name).await? {
        return Ok((existing, false));
    }

    // Organization owners are resolved elsewhere.
    let owner = (remote.owner.login == user.login).then_some(Owner::User(user.id));
    let repository = NewRepository {
        owner_name: owner_name.to_string(),
        name: remote.name.clone(),
        owner,
    }
    .into_repository(Utc::now());

    match tx.insert_repository(&repository).await {
        Ok(()) => Ok((repository, true)),
        Err(DbError::Duplicate(msg)) => {
            let winner = tx.find_repository_by_slug(owner_name, &remote.name).await?;
            winner
                .map(|r| (r, false))
                .ok_or(DbError::Duplicate(msg))
        }
        Err(e) => Err(e),
    }
}

async fn ensure_permission(
    tx: &mut dyn StoreTx,
    user: &User,
    repository: &Repository,
    remote: &RemoteRepository,
) -> DbResult<(Permission, PermissionChange)> {
    let caps = remote.permissions;

    let mut permission = match tx.find_permission(user.id, repository.id).await? {
        Some(existing) => existing,
        None => {
            let permission = Permission::new(user.id, repository.id, caps);
            match tx.insert_permission(&permission).await {
                Ok(()) => return Ok((permission, PermissionChange::Created)),
                Err(DbError::Duplicate(msg)) => tx
                    .find_permission(user.id, repository.id)
                    .await?
                    .ok_or(DbError::Duplicate(msg))?,
                Err(e) => return Err(e),
            }
        }
    };

    if permission.capabilities() == caps {
        return Ok((permission, PermissionChange::Unchanged));
    }
    permission.set_capabilities(caps);
    tx.update_permission(&permission).await?;
    Ok((permission, PermissionChange::Updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::repository::{Capabilities, RemoteOwner};
    use drover_db::MemoryStore;

    fn user() -> User {
        User {
            id: ResourceId::new(),
            login: "sven".to_string(),
        }
    }

    fn remote(owner: &str, name: &str, push: bool) -> RemoteRepository {
        RemoteRepository {
            name: name.to_string(),
            owner: RemoteOwner {
                login: owner.to_string(),
            },
            permissions: Capabilities {
                admin: false,
                push,
                pull: true,
            },
        }
    }

    fn synchronizer(store: &MemoryStore, prune: bool) -> RepositorySynchronizer {
        RepositorySynchronizer::new(
            Arc::new(store.clone()),
            SyncConfig {
                retries: 3,
                prune_permissions: prune,
            },
        )
    }

    #[tokio::test]
    async fn test_first_sync_creates_repository_and_permission() {
        let store = MemoryStore::new();
        let user = user();
        let outcome = synchronizer(&store, false)
            .sync(&user, &remote("sven", "minimal", true))
            .await
            .unwrap();

        assert!(outcome.repository_created);
        assert_eq!(outcome.permission_change, PermissionChange::Created);
        assert_eq!(outcome.repository.slug(), "sven/minimal");
        assert_eq!(outcome.repository.owner, Some(Owner::User(user.id)));
        assert!(!outcome.repository.active);
        assert!(outcome.repository.last_build_id.is_none());
        assert!(outcome.permission.push);
        assert!(outcome.permission.pull);
        assert!(!outcome.permission.admin);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, false);
        let user = user();
        let remote = remote("sven", "minimal", false);

        let first = sync.sync(&user, &remote).await.unwrap();
        for _ in 0..3 {
            let again = sync.sync(&user, &remote).await.unwrap();
            assert!(!again.repository_created);
            assert_eq!(again.permission_change, PermissionChange::Unchanged);
            assert_eq!(again.repository.id, first.repository.id);
            assert_eq!(again.permission.id, first.permission.id);
        }

        let state = store.snapshot().await;
        assert_eq!(state.repositories.len(), 1);
        assert_eq!(state.permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_repository_gets_new_permission() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, false);
        let owner = user();
        let other = User {
            id: ResourceId::new(),
            login: "josh".to_string(),
        };

        sync.sync(&owner, &remote("sven", "minimal", true))
            .await
            .unwrap();
        let outcome = sync
            .sync(&other, &remote("sven", "minimal", false))
            .await
            .unwrap();

        assert!(!outcome.repository_created);
        assert_eq!(outcome.permission_change, PermissionChange::Created);
        // Only the owner's login makes the user the owner.
        assert_eq!(outcome.repository.owner, Some(Owner::User(owner.id)));

        let state = store.snapshot().await;
        assert_eq!(state.repositories.len(), 1);
        assert_eq!(state.permissions.len(), 2);
    }

    #[tokio::test]
    async fn test_organization_repository_has_no_owner_yet() {
        let store = MemoryStore::new();
        let outcome = synchronizer(&store, false)
            .sync(&user(), &remote("travis-ci", "travis-core", false))
            .await
            .unwrap();
        assert!(outcome.repository.owner.is_none());
    }

    #[tokio::test]
    async fn test_changed_flags_are_updated_in_place() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, false);
        let user = user();

        let first = sync
            .sync(&user, &remote("sven", "minimal", false))
            .await
            .unwrap();
        let second = sync
            .sync(&user, &remote("sven", "minimal", true))
            .await
            .unwrap();

        assert_eq!(second.permission_change, PermissionChange::Updated);
        assert_eq!(second.permission.id, first.permission.id);

        let state = store.snapshot().await;
        assert_eq!(state.permissions.len(), 1);
        assert!(state.permissions[&first.permission.id].push);
    }

    #[tokio::test]
    async fn test_lost_repository_race_uses_winner() {
        let store = MemoryStore::new();
        let winner = NewRepository {
            owner_name: "sven".to_string(),
            name: "minimal".to_string(),
            owner: None,
        }
        .into_repository(Utc::now());
        store.race_repository_insert(winner.clone());

        let outcome = synchronizer(&store, false)
            .sync(&user(), &remote("sven", "minimal", false))
            .await
            .unwrap();

        assert!(!outcome.repository_created);
        assert_eq!(outcome.repository.id, winner.id);
        assert_eq!(outcome.permission.repository_id, winner.id);

        let state = store.snapshot().await;
        assert_eq!(state.repositories.len(), 1);
        assert_eq!(state.permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_permission_race_uses_winner() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, false);
        let user = user();
        let other = User {
            id: ResourceId::new(),
            login: "josh".to_string(),
        };
        let repository = sync
            .sync(&other, &remote("sven", "minimal", false))
            .await
            .unwrap()
            .repository;

        let winner = Permission::new(user.id, repository.id, Capabilities::default());
        store.race_permission_insert(winner.clone());

        let outcome = sync
            .sync(&user, &remote("sven", "minimal", true))
            .await
            .unwrap();

        // The winner's flags were stale, so they are brought up to date.
        assert_eq!(outcome.permission.id, winner.id);
        assert_eq!(outcome.permission_change, PermissionChange::Updated);
        assert!(outcome.permission.push);

        let state = store.snapshot().await;
        assert_eq!(state.permissions.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_all_reports_and_prunes() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, true);
        let user = user();

        let report = sync
            .sync_all(
                &user,
                &[
                    remote("sven", "minimal", false),
                    remote("sven", "gem-release", true),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            report,
            SyncReport {
                repositories_synced: 2,
                repositories_created: 2,
                permissions_created: 2,
                permissions_updated: 0,
                permissions_removed: 0,
            }
        );

        let report = sync
            .sync_all(&user, &[remote("sven", "minimal", true)])
            .await
            .unwrap();
        assert_eq!(report.repositories_created, 0);
        assert_eq!(report.permissions_updated, 1);
        assert_eq!(report.permissions_removed, 1);

        let state = store.snapshot().await;
        assert_eq!(state.repositories.len(), 2);
        assert_eq!(state.permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_keeps_permissions_without_prune() {
        let store = MemoryStore::new();
        let sync = synchronizer(&store, false);
        let user = user();

        sync.sync_all(
            &user,
            &[
                remote("sven", "minimal", false),
                remote("sven", "gem-release", false),
            ],
        )
        .await
        .unwrap();
        let report = sync.sync_all(&user, &[]).await.unwrap();

        assert_eq!(report.permissions_removed, 0);
        assert_eq!(store.snapshot().await.permissions.len(), 2);
    }
}
