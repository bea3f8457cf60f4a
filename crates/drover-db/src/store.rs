//! The transactional store contract.

use async_trait::async_trait;
use drover_core::ResourceId;
use drover_core::build::{Build, Job};
use drover_core::dispatch::DispatchMessage;
use drover_core::repository::{Permission, Repository};

use crate::DbResult;

/// A store that hands out scoped transactions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Open a transaction. Dropping it without [`StoreTx::commit`] rolls it back.
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>>;
}

/// Candidates to leave out of [`StoreTx::queueable_jobs`].
///
/// The enqueuer fills this with owners and repositories that reached their
/// concurrency limit, so the next page reaches the jobs behind them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub owners: Vec<String>,
    pub repositories: Vec<ResourceId>,
}

impl QueueFilter {
    pub fn exclude_owner(&mut self, owner_name: &str) {
        if !self.owners.iter().any(|o| o == owner_name) {
            self.owners.push(owner_name.to_string());
        }
    }

    pub fn exclude_repository(&mut self, id: ResourceId) {
        if !self.repositories.contains(&id) {
            self.repositories.push(id);
        }
    }

    pub fn allows(&self, owner_name: &str, repository_id: ResourceId) -> bool {
        !self.owners.iter().any(|o| o == owner_name)
            && !self.repositories.contains(&repository_id)
    }
}

/// Operations available inside one transaction.
///
/// `lock_*` methods take a row lock held until the transaction ends, so
/// callers touching the same rows are serialized. Inserts report a
/// uniqueness conflict as [`crate::DbError::Duplicate`].
#[async_trait]
pub trait StoreTx: Send {
    // Repositories
    async fn find_repository(&mut self, id: ResourceId) -> DbResult<Option<Repository>>;
    async fn find_repository_by_slug(
        &mut self,
        owner_name: &str,
        name: &str,
    ) -> DbResult<Option<Repository>>;
    async fn lock_repository(&mut self, id: ResourceId) -> DbResult<Repository>;
    async fn insert_repository(&mut self, repository: &Repository) -> DbResult<()>;
    async fn update_repository(&mut self, repository: &Repository) -> DbResult<()>;

    // Permissions
    async fn find_permission(
        &mut self,
        user_id: ResourceId,
        repository_id: ResourceId,
    ) -> DbResult<Option<Permission>>;
    async fn insert_permission(&mut self, permission: &Permission) -> DbResult<()>;
    async fn update_permission(&mut self, permission: &Permission) -> DbResult<()>;
    async fn permissions_for_user(&mut self, user_id: ResourceId) -> DbResult<Vec<Permission>>;
    async fn delete_permission(&mut self, id: ResourceId) -> DbResult<()>;

    // Builds
    async fn insert_build(&mut self, build: &Build) -> DbResult<()>;
    async fn find_build(&mut self, id: ResourceId) -> DbResult<Option<Build>>;
    async fn lock_build(&mut self, id: ResourceId) -> DbResult<Build>;
    async fn update_build(&mut self, build: &Build) -> DbResult<()>;

    // Jobs
    async fn insert_job(&mut self, job: &Job) -> DbResult<()>;
    async fn find_job(&mut self, id: ResourceId) -> DbResult<Option<Job>>;
    async fn lock_job(&mut self, id: ResourceId) -> DbResult<Job>;
    /// Jobs of a build in matrix order.
    async fn jobs_for_build(&mut self, build_id: ResourceId) -> DbResult<Vec<Job>>;
    async fn update_job(&mut self, job: &Job) -> DbResult<()>;
    /// Up to `limit` runnable jobs, oldest build first, in matrix order.
    ///
    /// A job is runnable when it is `created`, its repository is active, its
    /// build has not finished and no job of an earlier stage is unfinished.
    /// Jobs matching `filter` and rows locked by another transaction are
    /// skipped.
    async fn queueable_jobs(&mut self, limit: u32, filter: &QueueFilter) -> DbResult<Vec<Job>>;
    /// Jobs in `queued` or `started` across all repositories of an owner.
    async fn count_in_flight_for_owner(&mut self, owner_name: &str) -> DbResult<u32>;
    /// Jobs in `queued` or `started` for one repository.
    async fn count_in_flight_for_repository(&mut self, repository_id: ResourceId)
    -> DbResult<u32>;

    // Work queue
    /// Add a pending work queue entry. It becomes visible to workers only
    /// when the transaction commits.
    async fn insert_dispatch(&mut self, message: &DispatchMessage) -> DbResult<()>;

    async fn commit(self: Box<Self>) -> DbResult<()>;
    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
