//! Work queue that enqueued jobs are handed to.
//!
//! The enqueuer writes queue entries inside its own transaction. Workers
//! claim them from [`PgJobQueue`], and in-process consumers can follow
//! along through a [`Dispatcher`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;

pub use drover_core::dispatch::DispatchMessage;

use crate::{SchedulerError, SchedulerResult};

/// Receives jobs once their enqueue has committed.
///
/// The work queue entry is already stored by then, so a failed dispatch
/// never un-queues a job.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: &DispatchMessage) -> SchedulerResult<()>;
}

/// Dispatcher feeding an in-process channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchMessage>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DispatchMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: &DispatchMessage) -> SchedulerResult<()> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| SchedulerError::Dispatch("work channel closed".to_string()))
    }
}

/// A job waiting in the PostgreSQL work queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedJob {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub payload: serde_json::Value,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn message(&self) -> Result<DispatchMessage, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Work queue backed by PostgreSQL.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim the oldest pending entry.
    /// Uses SKIP LOCKED so concurrent workers never claim the same entry.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueuedJob>, sqlx::Error> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Remove an entry once the worker has reported back.
    pub async fn complete(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a claimed entry back to pending (e.g., on worker crash recovery).
    pub async fn release(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE job_queue SET status = 'pending', claimed_by = NULL, claimed_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::ResourceId;
    use drover_core::build::{NewBuild, NewJob};
    use drover_core::repository::NewRepository;

    #[tokio::test]
    async fn test_channel_dispatcher_delivers_message() {
        let repository = NewRepository {
            owner_name: "svenfuchs".to_string(),
            name: "minimal".to_string(),
            owner: None,
        }
        .into_repository(Utc::now());
        let build = NewBuild {
            repository_id: repository.id,
            number: 7,
        }
        .into_build(Utc::now());
        let job = NewJob {
            position: 2,
            stage: 1,
            allow_failure: false,
            config: serde_json::json!({ "script": ["rake"] }),
        }
        .into_job(&build, Utc::now());

        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        dispatcher
            .dispatch(&DispatchMessage::new(&job, &repository))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.job_id, job.id);
        assert_eq!(message.build_id, build.id);
        assert_eq!(message.repository_slug, "svenfuchs/minimal");
        assert_eq!(message.number, "7.2");
        assert_eq!(message.config["script"][0], "rake");
    }

    #[tokio::test]
    async fn test_closed_channel_is_a_dispatch_error() {
        let (dispatcher, rx) = ChannelDispatcher::new(1);
        drop(rx);

        let message = DispatchMessage {
            job_id: ResourceId::new(),
            build_id: ResourceId::new(),
            repository_slug: "a/b".to_string(),
            number: "1.1".to_string(),
            config: serde_json::Value::Null,
        };
        let err = dispatcher.dispatch(&message).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Dispatch(_)));
    }
}
