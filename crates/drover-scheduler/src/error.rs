//! Scheduler error types.

use drover_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed input, e.g. an event payload without a job id.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A creation race that could not be resolved within the retry budget.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store failed. Nothing of the operation was committed.
    #[error("persistence error: {0}")]
    Persistence(#[source] DbError),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DbError> for SchedulerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => SchedulerError::NotFound(msg),
            DbError::Duplicate(msg) => SchedulerError::Conflict(msg),
            _ => SchedulerError::Persistence(err),
        }
    }
}

impl From<drover_core::Error> for SchedulerError {
    fn from(err: drover_core::Error) -> Self {
        match err {
            drover_core::Error::InvalidInput(msg) => SchedulerError::Validation(msg),
            drover_core::Error::NotFound(msg) => SchedulerError::NotFound(msg),
            drover_core::Error::Conflict(msg) => SchedulerError::Conflict(msg),
            _ => SchedulerError::Internal(err.to_string()),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
