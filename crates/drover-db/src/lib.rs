//! State store for Drover CI.
//!
//! Defines the transactional store contract used by the scheduler services,
//! with a PostgreSQL implementation and an in-memory one.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStateStore;
pub use store::{QueueFilter, StateStore, StoreTx};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
