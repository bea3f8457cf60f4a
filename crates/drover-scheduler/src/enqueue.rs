//! Job Enqueuer.
//!
//! Picks runnable jobs and marks them queued within the owner and repository
//! concurrency limits. Each job's work queue entry is written in the same
//! transaction, and a [`Dispatcher`] hears about the jobs after the commit.

use chrono::Utc;
use drover_config::EnqueueConfig;
use drover_core::{ResourceId, State};
use drover_core::repository::Repository;
use drover_db::{QueueFilter, StateStore, StoreTx};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::queue::{DispatchMessage, Dispatcher};
use crate::{SchedulerError, SchedulerResult};

/// What one enqueue pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    /// Jobs moved to `queued`, in queue order.
    pub enqueued: Vec<ResourceId>,
    pub skipped_capacity: usize,
}

pub struct JobEnqueuer {
    store: Arc<dyn StateStore>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: EnqueueConfig,
}

/// Rows looked up during one pass.
#[derive(Default)]
struct PassCache {
    repositories: HashMap<ResourceId, Repository>,
    owner_load: HashMap<String, u32>,
    repository_load: HashMap<ResourceId, u32>,
}

impl PassCache {
    async fn repository(
        &mut self,
        tx: &mut dyn StoreTx,
        id: ResourceId,
    ) -> SchedulerResult<Repository> {
        if let Some(repository) = self.repositories.get(&id) {
            return Ok(repository.clone());
        }
        let repository = tx
            .find_repository(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("repository {}", id)))?;
        self.repositories.insert(id, repository.clone());
        Ok(repository)
    }

    async fn owner_load(&mut self, tx: &mut dyn StoreTx, owner_name: &str) -> SchedulerResult<u32> {
        if let Some(load) = self.owner_load.get(owner_name) {
            return Ok(*load);
        }
        let load = tx.count_in_flight_for_owner(owner_name).await?;
        self.owner_load.insert(owner_name.to_string(), load);
        Ok(load)
    }

    async fn repository_load(&mut self, tx: &mut dyn StoreTx, id: ResourceId) -> SchedulerResult<u32> {
        if let Some(load) = self.repository_load.get(&id) {
            return Ok(*load);
        }
        let load = tx.count_in_flight_for_repository(id).await?;
        self.repository_load.insert(id, load);
        Ok(load)
    }

    fn reserve(&mut self, repository: &Repository) {
        *self
            .owner_load
            .entry(repository.owner_name.clone())
            .or_default() += 1;
        *self.repository_load.entry(repository.id).or_default() += 1;
    }
}

impl JobEnqueuer {
    pub fn new(store: Arc<dyn StateStore>, config: EnqueueConfig) -> Self {
        Self {
            store,
            dispatcher: None,
            config,
        }
    }

    /// Hand every committed job to `dispatcher` as well.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Run one enqueue pass, queueing at most `batch_size` jobs.
    ///
    /// Jobs and their work queue entries commit together. If anything fails
    /// before the commit the pass rolls back and every job stays `created`.
    #[instrument(skip(self))]
    pub async fn enqueue(&self) -> SchedulerResult<EnqueueReport> {
        let mut tx = self.store.begin().await?;

        let mut report = EnqueueReport::default();
        let mut cache = PassCache::default();
        let mut filter = QueueFilter::default();
        let mut selected: Vec<DispatchMessage> = Vec::new();
        let now = Utc::now();

        // Owners and repositories at capacity are filtered out of the next
        // page, so every page either queues a job or shrinks the candidates.
        loop {
            let remaining = self.config.batch_size.saturating_sub(selected.len() as u32);
            if remaining == 0 {
                break;
            }
            let candidates = tx.queueable_jobs(remaining, &filter).await?;
            if candidates.is_empty() {
                break;
            }

            for mut job in candidates {
                let repository = cache.repository(tx.as_mut(), job.repository_id).await?;

                let owner_limit = self.config.limit_for_owner(&repository.owner_name);
                if cache.owner_load(tx.as_mut(), &repository.owner_name).await? >= owner_limit {
                    debug!(job_id = %job.id, owner = %repository.owner_name, "Owner at capacity");
                    filter.exclude_owner(&repository.owner_name);
                    report.skipped_capacity += 1;
                    continue;
                }
                if let Some(max) = repository.max_concurrent_jobs {
                    if cache.repository_load(tx.as_mut(), repository.id).await? >= max {
                        debug!(
                            job_id = %job.id,
                            repository = %repository.slug(),
                            "Repository at capacity"
                        );
                        filter.exclude_repository(repository.id);
                        report.skipped_capacity += 1;
                        continue;
                    }
                }

                cache.reserve(&repository);
                job.state = State::Queued;
                job.queued_at = Some(now);
                job.updated_at = now;
                tx.update_job(&job).await?;

                let message = DispatchMessage::new(&job, &repository);
                tx.insert_dispatch(&message).await?;
                selected.push(message);
            }
        }

        tx.commit().await?;

        if let Some(dispatcher) = &self.dispatcher {
            for message in &selected {
                match dispatcher.dispatch(message).await {
                    Ok(()) => debug!(
                        job_id = %message.job_id,
                        repository = %message.repository_slug,
                        "Dispatched job"
                    ),
                    Err(e) => warn!(
                        job_id = %message.job_id,
                        error = %e,
                        "Failed to dispatch queued job"
                    ),
                }
            }
        }

        report.enqueued = selected.iter().map(|m| m.job_id).collect();
        if !report.enqueued.is_empty() {
            info!(
                enqueued = report.enqueued.len(),
                skipped_capacity = report.skipped_capacity,
                "Enqueued jobs"
            );
        }
        Ok(report)
    }

    /// Run enqueue passes every `interval_ms` until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.config.interval_ms, "Starting enqueuer");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping enqueuer");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.enqueue().await {
                        warn!(error = %e, "Enqueue pass failed");
                    }
                }
            }
        }
    }
}
