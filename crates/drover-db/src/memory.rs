//! In-memory store.
//!
//! A transaction takes the store's lock for its whole lifetime and works on
//! a copy of the state, which replaces the shared state only on commit. This
//! gives serializable transactions with all-or-nothing writes.

use async_trait::async_trait;
use drover_core::build::{Build, Job, blocked_by_earlier_stage};
use drover_core::dispatch::DispatchMessage;
use drover_core::repository::{Permission, Repository};
use drover_core::{ResourceId, State};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{DbError, DbResult, QueueFilter, StateStore, StoreTx};

/// Everything the in-memory store holds.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub repositories: HashMap<ResourceId, Repository>,
    pub permissions: HashMap<ResourceId, Permission>,
    pub builds: HashMap<ResourceId, Build>,
    pub jobs: HashMap<ResourceId, Job>,
    /// Pending work queue entries in insertion order.
    pub queue: Vec<DispatchMessage>,
}

/// Rows another writer commits just before our next insert of the same kind.
#[derive(Debug, Default)]
struct Races {
    repositories: VecDeque<Repository>,
    permissions: VecDeque<Permission>,
}

/// Store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    races: Arc<std::sync::Mutex<Races>>,
    fail_next_commit: Arc<AtomicBool>,
    dispatch_budget: Arc<std::sync::Mutex<Option<usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Make the next repository insert lose a creation race against `winner`.
    ///
    /// `winner` is committed at the moment of the insert, and the insert
    /// reports a duplicate.
    pub fn race_repository_insert(&self, winner: Repository) {
        self.lock_races().repositories.push_back(winner);
    }

    /// Make the next permission insert lose a creation race against `winner`.
    pub fn race_permission_insert(&self, winner: Permission) {
        self.lock_races().permissions.push_back(winner);
    }

    /// Make the next commit fail as if the store went away.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Let `count` more work queue inserts succeed, then fail the next one as
    /// if the store went away.
    pub fn fail_dispatch_after(&self, count: usize) {
        *self
            .dispatch_budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(count);
    }

    fn lock_races(&self) -> std::sync::MutexGuard<'_, Races> {
        self.races.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            races: self.races.clone(),
            fail_next_commit: self.fail_next_commit.clone(),
            dispatch_budget: self.dispatch_budget.clone(),
        }))
    }
}

/// A transaction on a [`MemoryStore`].
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    races: Arc<std::sync::Mutex<Races>>,
    fail_next_commit: Arc<AtomicBool>,
    dispatch_budget: Arc<std::sync::Mutex<Option<usize>>>,
}

impl MemoryTx {
    fn take_repository_race(&mut self) -> Option<Repository> {
        let mut races = self
            .races
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        races.repositories.pop_front()
    }

    fn take_permission_race(&mut self) -> Option<Permission> {
        let mut races = self
            .races
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        races.permissions.pop_front()
    }

    fn in_flight<'a>(jobs: impl Iterator<Item = &'a Job>) -> u32 {
        jobs.filter(|j| matches!(j.state, State::Queued | State::Started))
            .count() as u32
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_repository(&mut self, id: ResourceId) -> DbResult<Option<Repository>> {
        Ok(self.working.repositories.get(&id).cloned())
    }

    async fn find_repository_by_slug(
        &mut self,
        owner_name: &str,
        name: &str,
    ) -> DbResult<Option<Repository>> {
        Ok(self
            .working
            .repositories
            .values()
            .find(|r| r.owner_name == owner_name && r.name == name)
            .cloned())
    }

    async fn lock_repository(&mut self, id: ResourceId) -> DbResult<Repository> {
        self.find_repository(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    async fn insert_repository(&mut self, repository: &Repository) -> DbResult<()> {
        if let Some(winner) = self.take_repository_race() {
            self.guard.repositories.insert(winner.id, winner.clone());
            self.working.repositories.insert(winner.id, winner);
        }

        let taken = self
            .working
            .repositories
            .values()
            .any(|r| r.owner_name == repository.owner_name && r.name == repository.name);
        if taken || self.working.repositories.contains_key(&repository.id) {
            return Err(DbError::Duplicate(format!("repository {}", repository.slug())));
        }

        self.working
            .repositories
            .insert(repository.id, repository.clone());
        Ok(())
    }

    async fn update_repository(&mut self, repository: &Repository) -> DbResult<()> {
        match self.working.repositories.get_mut(&repository.id) {
            Some(row) => {
                *row = repository.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("repository {}", repository.id))),
        }
    }

    async fn find_permission(
        &mut self,
        user_id: ResourceId,
        repository_id: ResourceId,
    ) -> DbResult<Option<Permission>> {
        Ok(self
            .working
            .permissions
            .values()
            .find(|p| p.user_id == user_id && p.repository_id == repository_id)
            .cloned())
    }

    async fn insert_permission(&mut self, permission: &Permission) -> DbResult<()> {
        if let Some(winner) = self.take_permission_race() {
            self.guard.permissions.insert(winner.id, winner.clone());
            self.working.permissions.insert(winner.id, winner);
        }

        let taken = self.working.permissions.values().any(|p| {
            p.user_id == permission.user_id && p.repository_id == permission.repository_id
        });
        if taken || self.working.permissions.contains_key(&permission.id) {
            return Err(DbError::Duplicate(format!(
                "permission for user {} on repository {}",
                permission.user_id, permission.repository_id
            )));
        }

        self.working
            .permissions
            .insert(permission.id, permission.clone());
        Ok(())
    }

    async fn update_permission(&mut self, permission: &Permission) -> DbResult<()> {
        match self.working.permissions.get_mut(&permission.id) {
            Some(row) => {
                *row = permission.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("permission {}", permission.id))),
        }
    }

    async fn permissions_for_user(&mut self, user_id: ResourceId) -> DbResult<Vec<Permission>> {
        let mut permissions: Vec<Permission> = self
            .working
            .permissions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        permissions.sort_by_key(|p| p.id);
        Ok(permissions)
    }

    async fn delete_permission(&mut self, id: ResourceId) -> DbResult<()> {
        self.working.permissions.remove(&id);
        Ok(())
    }

    async fn insert_build(&mut self, build: &Build) -> DbResult<()> {
        if self.working.builds.contains_key(&build.id) {
            return Err(DbError::Duplicate(format!("build {}", build.id)));
        }
        self.working.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn find_build(&mut self, id: ResourceId) -> DbResult<Option<Build>> {
        Ok(self.working.builds.get(&id).cloned())
    }

    async fn lock_build(&mut self, id: ResourceId) -> DbResult<Build> {
        self.find_build(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn update_build(&mut self, build: &Build) -> DbResult<()> {
        match self.working.builds.get_mut(&build.id) {
            Some(row) => {
                *row = build.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("build {}", build.id))),
        }
    }

    async fn insert_job(&mut self, job: &Job) -> DbResult<()> {
        if self.working.jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        self.working.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job(&mut self, id: ResourceId) -> DbResult<Option<Job>> {
        Ok(self.working.jobs.get(&id).cloned())
    }

    async fn lock_job(&mut self, id: ResourceId) -> DbResult<Job> {
        self.find_job(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn jobs_for_build(&mut self, build_id: ResourceId) -> DbResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .working
            .jobs
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.position);
        Ok(jobs)
    }

    async fn update_job(&mut self, job: &Job) -> DbResult<()> {
        match self.working.jobs.get_mut(&job.id) {
            Some(row) => {
                *row = job.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn queueable_jobs(&mut self, limit: u32, filter: &QueueFilter) -> DbResult<Vec<Job>> {
        let state = &self.working;
        let runnable = |job: &Job| {
            let Some(repository) = state.repositories.get(&job.repository_id) else {
                return false;
            };
            let Some(build) = state.builds.get(&job.build_id) else {
                return false;
            };
            let siblings: Vec<Job> = state
                .jobs
                .values()
                .filter(|j| j.build_id == job.build_id)
                .cloned()
                .collect();
            repository.active
                && filter.allows(&repository.owner_name, repository.id)
                && !build.state.is_terminal()
                && !blocked_by_earlier_stage(job, &siblings)
        };

        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.state == State::Created && runnable(*j))
            .collect();
        jobs.sort_by_key(|j| {
            let created = state.builds.get(&j.build_id).map(|b| b.created_at);
            (created, j.build_id, j.position)
        });
        Ok(jobs
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_in_flight_for_owner(&mut self, owner_name: &str) -> DbResult<u32> {
        let repositories = &self.working.repositories;
        Ok(Self::in_flight(self.working.jobs.values().filter(|j| {
            repositories
                .get(&j.repository_id)
                .is_some_and(|r| r.owner_name == owner_name)
        })))
    }

    async fn count_in_flight_for_repository(
        &mut self,
        repository_id: ResourceId,
    ) -> DbResult<u32> {
        Ok(Self::in_flight(
            self.working
                .jobs
                .values()
                .filter(|j| j.repository_id == repository_id),
        ))
    }

    async fn insert_dispatch(&mut self, message: &DispatchMessage) -> DbResult<()> {
        {
            let mut budget = self
                .dispatch_budget
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match budget.as_mut() {
                Some(0) => {
                    *budget = None;
                    return Err(DbError::Unavailable("work queue insert failed".to_string()));
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        self.working.queue.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DbError::Unavailable("commit failed".to_string()));
        }
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_core::build::{NewBuild, NewJob};
    use drover_core::repository::{Capabilities, NewRepository};

    /// A build of `repository`, with one job per entry of `stages` pushed onto `jobs`.
    fn build_with_jobs(jobs: &mut Vec<Job>, repository: &Repository, stages: &[u32]) -> Build {
        let build = NewBuild {
            repository_id: repository.id,
            number: 1,
        }
        .into_build(Utc::now());
        for (i, stage) in stages.iter().enumerate() {
            jobs.push(
                NewJob {
                    position: i as u32 + 1,
                    stage: *stage,
                    allow_failure: false,
                    config: serde_json::json!({}),
                }
                .into_job(&build, Utc::now()),
            );
        }
        build
    }

    fn new_repository(owner: &str, name: &str) -> Repository {
        NewRepository {
            owner_name: owner.to_string(),
            name: name.to_string(),
            owner: None,
        }
        .into_repository(Utc::now())
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let repo = new_repository("svenfuchs", "minimal");

        let mut tx = store.begin().await.unwrap();
        tx.insert_repository(&repo).await.unwrap();
        tx.commit().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.repositories.get(&repo.id), Some(&repo));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_repository(&new_repository("svenfuchs", "minimal"))
                .await
                .unwrap();
        }

        assert!(store.snapshot().await.repositories.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_discards_writes() {
        let store = MemoryStore::new();
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.insert_repository(&new_repository("svenfuchs", "minimal"))
            .await
            .unwrap();
        assert!(matches!(tx.commit().await, Err(DbError::Unavailable(_))));

        assert!(store.snapshot().await.repositories.is_empty());
    }

    #[tokio::test]
    async fn test_unique_slug() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_repository(&new_repository("svenfuchs", "minimal"))
            .await
            .unwrap();

        let err = tx
            .insert_repository(&new_repository("svenfuchs", "minimal"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_lost_race_commits_winner() {
        let store = MemoryStore::new();
        let winner = new_repository("svenfuchs", "minimal");
        store.race_repository_insert(winner.clone());

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_repository(&new_repository("svenfuchs", "minimal"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));

        let found = tx
            .find_repository_by_slug("svenfuchs", "minimal")
            .await
            .unwrap();
        assert_eq!(found, Some(winner.clone()));
        tx.rollback().await.unwrap();

        // The winner committed on its own.
        assert!(store.snapshot().await.repositories.contains_key(&winner.id));
    }

    #[tokio::test]
    async fn test_unique_permission_per_user_and_repository() {
        let store = MemoryStore::new();
        let user = ResourceId::new();
        let repo = ResourceId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_permission(&Permission::new(user, repo, Capabilities::default()))
            .await
            .unwrap();
        let err = tx
            .insert_permission(&Permission::new(user, repo, Capabilities::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_queueable_jobs_and_in_flight_counts() {
        let store = MemoryStore::new();
        let mut repo = new_repository("svenfuchs", "minimal");
        repo.active = true;
        let build = NewBuild {
            repository_id: repo.id,
            number: 1,
        }
        .into_build(Utc::now());
        let jobs: Vec<Job> = (1..=3)
            .map(|position| {
                NewJob {
                    position,
                    stage: 1,
                    allow_failure: false,
                    config: serde_json::json!({}),
                }
                .into_job(&build, Utc::now())
            })
            .collect();

        let mut tx = store.begin().await.unwrap();
        tx.insert_repository(&repo).await.unwrap();
        tx.insert_build(&build).await.unwrap();
        for job in jobs.iter().rev() {
            tx.insert_job(job).await.unwrap();
        }

        let mut started = jobs[0].clone();
        started.state = State::Started;
        tx.update_job(&started).await.unwrap();

        let queueable = tx.queueable_jobs(10, &QueueFilter::default()).await.unwrap();
        let positions: Vec<u32> = queueable.iter().map(|j| j.position).collect();
        assert_eq!(positions, vec![2, 3]);
        assert_eq!(
            tx.queueable_jobs(1, &QueueFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );

        assert_eq!(tx.count_in_flight_for_owner("svenfuchs").await.unwrap(), 1);
        assert_eq!(tx.count_in_flight_for_owner("someone").await.unwrap(), 0);
        assert_eq!(
            tx.count_in_flight_for_repository(repo.id).await.unwrap(),
            1
        );

        let ordered = tx.jobs_for_build(build.id).await.unwrap();
        let positions: Vec<u32> = ordered.iter().map(|j| j.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_queueable_jobs_leave_out_jobs_that_cannot_run() {
        let store = MemoryStore::new();
        let inactive = new_repository("svenfuchs", "inactive");
        let mut finished = new_repository("svenfuchs", "finished");
        finished.active = true;
        let mut staged = new_repository("svenfuchs", "staged");
        staged.active = true;
        let mut busy = new_repository("travis-ci", "travis-core");
        busy.active = true;

        let mut jobs = Vec::new();
        let mut builds = vec![
            build_with_jobs(&mut jobs, &inactive, &[1]),
            build_with_jobs(&mut jobs, &finished, &[1]),
            build_with_jobs(&mut jobs, &staged, &[1, 2]),
            build_with_jobs(&mut jobs, &busy, &[1]),
        ];
        builds[1].state = State::Canceled;

        let mut tx = store.begin().await.unwrap();
        for repo in [&inactive, &finished, &staged, &busy] {
            tx.insert_repository(repo).await.unwrap();
        }
        for build in &builds {
            tx.insert_build(build).await.unwrap();
        }
        for job in &jobs {
            tx.insert_job(job).await.unwrap();
        }

        let mut filter = QueueFilter::default();
        filter.exclude_owner("travis-ci");
        let queueable = tx.queueable_jobs(10, &filter).await.unwrap();
        let ids: Vec<ResourceId> = queueable.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![jobs[2].id]);

        // The later stage becomes runnable once the first stage finished.
        let mut first = jobs[2].clone();
        first.state = State::Passed;
        tx.update_job(&first).await.unwrap();
        let queueable = tx.queueable_jobs(10, &filter).await.unwrap();
        let ids: Vec<ResourceId> = queueable.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![jobs[3].id]);

        let queueable = tx.queueable_jobs(10, &QueueFilter::default()).await.unwrap();
        assert_eq!(queueable.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_entries_commit_with_transaction() {
        let store = MemoryStore::new();
        let message = DispatchMessage {
            job_id: ResourceId::new(),
            build_id: ResourceId::new(),
            repository_slug: "svenfuchs/minimal".to_string(),
            number: "1.1".to_string(),
            config: serde_json::json!({}),
        };

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_dispatch(&message).await.unwrap();
        }
        assert!(store.snapshot().await.queue.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_dispatch(&message).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.queue, vec![message.clone()]);

        store.fail_dispatch_after(1);
        let mut tx = store.begin().await.unwrap();
        tx.insert_dispatch(&message).await.unwrap();
        let err = tx.insert_dispatch(&message).await.unwrap_err();
        assert!(matches!(err, DbError::Unavailable(_)));
    }
}
