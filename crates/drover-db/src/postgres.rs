//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::build::{Build, Job};
use drover_core::dispatch::DispatchMessage;
use drover_core::repository::{Owner, Permission, Repository};
use drover_core::{ResourceId, State};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{DbError, DbResult, QueueFilter, StateStore, StoreTx};

/// Database row for repositories.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: Uuid,
    pub owner_name: String,
    pub name: String,
    pub owner_type: Option<String>,
    pub owner_id: Option<Uuid>,
    pub active: bool,
    pub max_concurrent_jobs: Option<i32>,
    pub key_id: Option<Uuid>,
    pub last_build_id: Option<Uuid>,
    pub last_build_state: Option<String>,
    pub last_build_started_at: Option<DateTime<Utc>>,
    pub last_build_finished_at: Option<DateTime<Utc>>,
    pub last_build_duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RepositoryRow> for Repository {
    type Error = DbError;

    fn try_from(row: RepositoryRow) -> Result<Self, Self::Error> {
        let owner = match (row.owner_type, row.owner_id) {
            (Some(kind), Some(id)) => Some(
                Owner::from_parts(&kind, id.into()).map_err(DbError::InvalidData)?,
            ),
            _ => None,
        };
        let last_build_state = row.last_build_state.as_deref().map(parse_state).transpose()?;

        Ok(Repository {
            id: row.id.into(),
            owner_name: row.owner_name,
            name: row.name,
            owner,
            active: row.active,
            max_concurrent_jobs: row.max_concurrent_jobs.map(|n| n.max(0) as u32),
            key_id: row.key_id.map(Into::into),
            last_build_id: row.last_build_id.map(Into::into),
            last_build_state,
            last_build_started_at: row.last_build_started_at,
            last_build_finished_at: row.last_build_finished_at,
            last_build_duration: row.last_build_duration,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for permissions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PermissionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub repository_id: Uuid,
    pub admin: bool,
    pub push: bool,
    pub pull: bool,
}

impl From<PermissionRow> for Permission {
    fn from(row: PermissionRow) -> Self {
        Permission {
            id: row.id.into(),
            user_id: row.user_id.into(),
            repository_id: row.repository_id.into(),
            admin: row.admin,
            push: row.push,
            pull: row.pull,
        }
    }
}

/// Database row for builds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub number: i64,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        Ok(Build {
            id: row.id.into(),
            repository_id: row.repository_id.into(),
            number: row.number,
            state: parse_state(&row.state)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration: row.duration,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub build_id: Uuid,
    pub repository_id: Uuid,
    pub number: String,
    pub position: i32,
    pub stage: i32,
    pub allow_failure: bool,
    pub state: String,
    pub config: serde_json::Value,
    pub worker: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let position = u32::try_from(row.position)
            .map_err(|_| DbError::InvalidData(format!("job position {}", row.position)))?;
        let stage = u32::try_from(row.stage)
            .map_err(|_| DbError::InvalidData(format!("job stage {}", row.stage)))?;

        Ok(Job {
            id: row.id.into(),
            build_id: row.build_id.into(),
            repository_id: row.repository_id.into(),
            number: row.number,
            position,
            stage,
            allow_failure: row.allow_failure,
            state: parse_state(&row.state)?,
            config: row.config,
            worker: row.worker,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_state(s: &str) -> DbResult<State> {
    s.parse().map_err(DbError::InvalidData)
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// PostgreSQL implementation of [`StateStore`].
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

/// A transaction on a [`PgStateStore`].
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn find_repository(&mut self, id: ResourceId) -> DbResult<Option<Repository>> {
        sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Repository::try_from)
            .transpose()
    }

    async fn find_repository_by_slug(
        &mut self,
        owner_name: &str,
        name: &str,
    ) -> DbResult<Option<Repository>> {
        sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories WHERE owner_name = $1 AND name = $2",
        )
        .bind(owner_name)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Repository::try_from)
        .transpose()
    }

    async fn lock_repository(&mut self, id: ResourceId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        row.try_into()
    }

    async fn insert_repository(&mut self, repository: &Repository) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO repositories (
                id, owner_name, name, owner_type, owner_id, active, max_concurrent_jobs,
                key_id, last_build_id, last_build_state, last_build_started_at,
                last_build_finished_at, last_build_duration, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(repository.id.as_uuid())
        .bind(&repository.owner_name)
        .bind(&repository.name)
        .bind(repository.owner.map(|o| o.kind()))
        .bind(repository.owner.map(|o| *o.id().as_uuid()))
        .bind(repository.active)
        .bind(repository.max_concurrent_jobs.map(to_i32))
        .bind(repository.key_id.map(Uuid::from))
        .bind(repository.last_build_id.map(Uuid::from))
        .bind(repository.last_build_state.map(|s| s.as_str()))
        .bind(repository.last_build_started_at)
        .bind(repository.last_build_finished_at)
        .bind(repository.last_build_duration)
        .bind(repository.created_at)
        .bind(repository.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!("repository {}", repository.slug())));
        }
        Ok(())
    }

    async fn update_repository(&mut self, repository: &Repository) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET
                owner_type = $2, owner_id = $3, active = $4, max_concurrent_jobs = $5,
                key_id = $6, last_build_id = $7, last_build_state = $8,
                last_build_started_at = $9, last_build_finished_at = $10,
                last_build_duration = $11, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(repository.id.as_uuid())
        .bind(repository.owner.map(|o| o.kind()))
        .bind(repository.owner.map(|o| *o.id().as_uuid()))
        .bind(repository.active)
        .bind(repository.max_concurrent_jobs.map(to_i32))
        .bind(repository.key_id.map(Uuid::from))
        .bind(repository.last_build_id.map(Uuid::from))
        .bind(repository.last_build_state.map(|s| s.as_str()))
        .bind(repository.last_build_started_at)
        .bind(repository.last_build_finished_at)
        .bind(repository.last_build_duration)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", repository.id)));
        }
        Ok(())
    }

    async fn find_permission(
        &mut self,
        user_id: ResourceId,
        repository_id: ResourceId,
    ) -> DbResult<Option<Permission>> {
        let row = sqlx::query_as::<_, PermissionRow>(
            "SELECT * FROM permissions WHERE user_id = $1 AND repository_id = $2",
        )
        .bind(user_id.as_uuid())
        .bind(repository_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Permission::from))
    }

    async fn insert_permission(&mut self, permission: &Permission) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO permissions (id, user_id, repository_id, admin, push, pull)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(permission.id.as_uuid())
        .bind(permission.user_id.as_uuid())
        .bind(permission.repository_id.as_uuid())
        .bind(permission.admin)
        .bind(permission.push)
        .bind(permission.pull)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!(
                "permission for user {} on repository {}",
                permission.user_id, permission.repository_id
            )));
        }
        Ok(())
    }

    async fn update_permission(&mut self, permission: &Permission) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE permissions SET admin = $2, push = $3, pull = $4 WHERE id = $1")
                .bind(permission.id.as_uuid())
                .bind(permission.admin)
                .bind(permission.push)
                .bind(permission.pull)
                .execute(&mut *self.tx)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("permission {}", permission.id)));
        }
        Ok(())
    }

    async fn permissions_for_user(&mut self, user_id: ResourceId) -> DbResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            "SELECT * FROM permissions WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Permission::from).collect())
    }

    async fn delete_permission(&mut self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_build(&mut self, build: &Build) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (
                id, repository_id, number, state, started_at, finished_at, duration,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.repository_id.as_uuid())
        .bind(build.number)
        .bind(build.state.as_str())
        .bind(build.started_at)
        .bind(build.finished_at)
        .bind(build.duration)
        .bind(build.created_at)
        .bind(build.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_build(&mut self, id: ResourceId) -> DbResult<Option<Build>> {
        sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Build::try_from)
            .transpose()
    }

    async fn lock_build(&mut self, id: ResourceId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        row.try_into()
    }

    async fn update_build(&mut self, build: &Build) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds SET
                state = $2, started_at = $3, finished_at = $4, duration = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.state.as_str())
        .bind(build.started_at)
        .bind(build.finished_at)
        .bind(build.duration)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", build.id)));
        }
        Ok(())
    }

    async fn insert_job(&mut self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, build_id, repository_id, number, position, stage, allow_failure, state,
                config, worker, queued_at, started_at, finished_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.build_id.as_uuid())
        .bind(job.repository_id.as_uuid())
        .bind(&job.number)
        .bind(to_i32(job.position))
        .bind(to_i32(job.stage))
        .bind(job.allow_failure)
        .bind(job.state.as_str())
        .bind(&job.config)
        .bind(&job.worker)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_job(&mut self, id: ResourceId) -> DbResult<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn lock_job(&mut self, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn jobs_for_build(&mut self, build_id: ResourceId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE build_id = $1 ORDER BY position",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_job(&mut self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = $2, worker = $3, queued_at = $4, started_at = $5, finished_at = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.state.as_str())
        .bind(&job.worker)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn queueable_jobs(&mut self, limit: u32, filter: &QueueFilter) -> DbResult<Vec<Job>> {
        // NO KEY UPDATE leaves the key share lock free for the work queue's
        // foreign key check.
        let repositories: Vec<Uuid> = filter.repositories.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM jobs j
            JOIN builds b ON b.id = j.build_id
            JOIN repositories r ON r.id = j.repository_id
            WHERE j.state = 'created'
              AND r.active
              AND b.state NOT IN ('passed', 'failed', 'errored', 'canceled')
              AND NOT EXISTS (
                  SELECT 1 FROM jobs s
                  WHERE s.build_id = j.build_id
                    AND s.stage < j.stage
                    AND s.state NOT IN ('passed', 'failed', 'errored', 'canceled')
              )
              AND r.owner_name <> ALL($2)
              AND j.repository_id <> ALL($3)
            ORDER BY b.created_at, b.id, j.position
            LIMIT $1
            FOR NO KEY UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(i64::from(limit))
        .bind(filter.owners.clone())
        .bind(repositories)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_in_flight_for_owner(&mut self, owner_name: &str) -> DbResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs j
            JOIN repositories r ON r.id = j.repository_id
            WHERE r.owner_name = $1 AND j.state IN ('queued', 'started')
            "#,
        )
        .bind(owner_name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count as u32)
    }

    async fn count_in_flight_for_repository(
        &mut self,
        repository_id: ResourceId,
    ) -> DbResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE repository_id = $1 AND state IN ('queued', 'started')",
        )
        .bind(repository_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count as u32)
    }

    async fn insert_dispatch(&mut self, message: &DispatchMessage) -> DbResult<()> {
        let payload =
            serde_json::to_value(message).map_err(|e| DbError::InvalidData(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, job_id, payload, status, created_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(message.job_id.as_uuid())
        .bind(payload)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
