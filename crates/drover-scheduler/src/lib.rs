//! Repository sync, job state propagation and job enqueueing for Drover CI.
//!
//! - [`RepositorySynchronizer`] mirrors provider repositories and permissions.
//! - [`JobStateUpdater`] applies worker events and cascades them from job to
//!   build to repository.
//! - [`JobEnqueuer`] queues runnable jobs and writes their work queue entries.

pub mod enqueue;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod sync;
pub mod updater;

pub use enqueue::{EnqueueReport, JobEnqueuer};
pub use error::{SchedulerError, SchedulerResult};
pub use handlers::{Cascade, Transition};
pub use queue::{ChannelDispatcher, DispatchMessage, Dispatcher, PgJobQueue, QueuedJob};
pub use sync::{PermissionChange, RepositorySynchronizer, SyncOutcome, SyncReport};
pub use updater::{ApplyOutcome, JobStateUpdater};
