//! Job model: statuses, the stats record, the tracker and the handler contract.

pub mod context;
pub mod event;
pub mod handler;
pub mod stats;
pub mod status;
pub mod tracker;

pub use context::ExecutionContext;
pub use event::{HookCallback, SimpleStatusChange, StatusChange};
pub use handler::{parse_params, Handler, HandlerFactory, DEFAULT_PRIORITY, MAX_PRIORITY};
pub use stats::{AckHook, Stats};
pub use status::{Kind, OpCommand, Status};
pub use tracker::{Tracker, TrackerEnv};

/// Parameter key marking a queued job as a firing of a periodic policy.
pub const PERIODIC_EXECUTION_MARK: &str = "_job_kind_periodic_";

/// Link under which a job's stats are exposed.
pub fn ref_link(job_id: &str) -> String {
    format!("/api/v1/jobs/{}", job_id)
}

/// Tracking ID of one firing of periodic policy `policy_id`.
pub fn periodic_execution_id(policy_id: &str, epoch: i64) -> String {
    format!("{}@{}", policy_id, epoch)
}
