//! Job State Updater.
//!
//! Applies worker lifecycle events to a job and carries the result up to the
//! job's build and repository inside one store transaction.

use chrono::Utc;
use drover_core::event::{EventKind, WorkerEvent, WorkerPayload};
use drover_db::StateStore;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::handlers::{Cascade, Transition, handler_for};
use crate::{SchedulerError, SchedulerResult};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Transition),
    /// The event no longer applies to the job. Nothing was written.
    Stale { reason: String },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

pub struct JobStateUpdater {
    store: Arc<dyn StateStore>,
}

impl JobStateUpdater {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Validate a raw worker payload and apply it.
    pub async fn apply(
        &self,
        kind: EventKind,
        payload: &WorkerPayload,
    ) -> SchedulerResult<ApplyOutcome> {
        let event = payload.normalize(kind, Utc::now())?;
        self.apply_event(&event).await
    }

    /// Apply a validated event.
    ///
    /// Rows are locked build first, then job, then repository, so events for
    /// sibling jobs run one after another.
    #[instrument(skip(self, event), fields(job_id = %event.job_id, event = %event.kind))]
    pub async fn apply_event(&self, event: &WorkerEvent) -> SchedulerResult<ApplyOutcome> {
        let handler = handler_for(event.kind)
            .ok_or_else(|| SchedulerError::Internal(format!("no handler for {}", event.kind)))?;

        let mut tx = self.store.begin().await?;

        let build_id = tx
            .find_job(event.job_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("job {}", event.job_id)))?
            .build_id;
        let build = tx.lock_build(build_id).await?;
        let job = tx.lock_job(event.job_id).await?;
        let siblings = tx.jobs_for_build(build.id).await?;
        let repository = tx.lock_repository(build.repository_id).await?;

        let mut cascade = Cascade::new(job, build, siblings, repository);
        let transition = match handler(&mut cascade, event) {
            Ok(transition) => transition,
            Err(drover_core::Error::StaleEvent(reason)) => {
                tx.rollback().await?;
                warn!(reason = %reason, "Ignoring stale event");
                return Ok(ApplyOutcome::Stale { reason });
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();

        cascade.job.updated_at = now;
        tx.update_job(&cascade.job).await?;

        for id in &transition.canceled_jobs {
            if let Some(job) = cascade.siblings.iter_mut().find(|j| j.id == *id) {
                job.updated_at = now;
                tx.update_job(job).await?;
                debug!(canceled_job = %id, "Canceled job of a later stage");
            }
        }

        if transition.build_changed {
            cascade.build.updated_at = now;
            tx.update_build(&cascade.build).await?;
        }

        if transition.repository_changed {
            cascade.repository.updated_at = now;
            tx.update_repository(&cascade.repository).await?;
        }

        tx.commit().await?;

        info!(
            job_state = %transition.job_state,
            build_id = %cascade.build.id,
            build_state = %transition.build_state,
            repository = %cascade.repository.slug(),
            "Applied job event"
        );

        Ok(ApplyOutcome::Applied(transition))
    }
}
