#![allow(clippy::result_large_err)]
//! # Job Service Core
//!
//! Redis-backed background job runtime.
//!
//! ## Architecture
//!
//! - **Worker**: Queues, worker pool, retries with backoff, dead set and reaper
//! - **Runner**: Drives one job through its handler and records the outcome
//! - **Lifecycle**: Revision-guarded status tracking with a retry loop for failed writes
//! - **Hooks**: Webhook delivery with ACKs and a persistent resend queue
//! - **Period**: Cron policies turned into scheduled executions
//! - **Migration**: Versioned upgrades of the persisted data

pub mod app;
pub mod common;
pub mod config;
pub mod error;
pub mod hook;
pub mod job;
pub mod jobs;
pub mod lcm;
pub mod migration;
pub mod period;
pub mod runner;
pub mod telemetry;
pub mod worker;

pub use error::{ErrorCode, JobServiceError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::App;
    pub use crate::common::Parameters;
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, JobServiceError, Result};
    pub use crate::job::{parse_params, ExecutionContext, Handler, Kind, OpCommand, Stats, Status};
    pub use crate::period::Policy;
    pub use crate::worker::{BasicWorker, PoolStats};
}
