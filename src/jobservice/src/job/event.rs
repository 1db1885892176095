//! Status change notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::stats::Stats;
use super::status::Status;
use crate::error::Result;

/// Body posted to a job's web hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Stats>,
}

/// A status write that could not reach Redis, kept for the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatusChange {
    pub job_id: String,
    pub target_status: Status,
    pub revision: i64,
}

/// Receiver of status changes fired by trackers.
///
/// Implemented by the hook agent. Trackers run it on a spawned task, so an
/// implementation may take as long as its HTTP round-trip needs.
#[async_trait]
pub trait HookCallback: Send + Sync {
    async fn on_status_change(&self, hook_url: &str, change: StatusChange) -> Result<()>;
}
