//! Queue framework and the worker built on it.

pub mod basic;
pub mod enqueuer;
pub mod job;
pub mod pool;
pub mod reaper;
pub mod registry;

pub use basic::BasicWorker;
pub use enqueuer::Enqueuer;
pub use job::{EnqueuedJob, QueuedJob, NO_RETRY_FAILS};
pub use pool::{PoolStats, PoolStatus, WorkerPool};
pub use reaper::{Reaper, SyncReport};
pub use registry::{JobSpec, Registry};
