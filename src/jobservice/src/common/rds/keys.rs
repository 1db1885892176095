//! Redis key derivation.
//!
//! Every key the service touches is derived from a namespace through [`KeySpace`].
//! The layout is persistent state shared by every process of a deployment, so the
//! suffixes below must stay stable across releases.

use std::fmt;

/// Field of the stats hash holding the persisted status.
pub const FIELD_STATUS: &str = "status";
/// Field of the stats hash holding the status revision.
pub const FIELD_REVISION: &str = "revision";
/// Field appended to every hash write.
pub const FIELD_UPDATE_TIME: &str = "update_time";
/// Field of the stats hash holding the JSON ACK sub-record.
pub const FIELD_ACK: &str = "ack";

/// Namespaced key builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpace {
    namespace: String,
    prefix: String,
}

impl KeySpace {
    /// Create a key space for `namespace`. A trailing `:` is optional.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let trimmed = namespace.trim_end_matches(':').to_string();
        let prefix = format!("{}:", trimmed);
        Self {
            namespace: trimmed,
            prefix,
        }
    }

    /// The namespace without the trailing separator.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The namespace with the trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: impl fmt::Display) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job stats
    // ─────────────────────────────────────────────────────────────────────────

    /// Stats hash of one job.
    pub fn job_stats(&self, job_id: &str) -> String {
        self.key(format_args!("job_stats:{}", job_id))
    }

    /// Match pattern for every stats hash.
    pub fn job_stats_pattern(&self) -> String {
        self.key("job_stats:*")
    }

    /// Hash mapping job ID to its remaining in-progress slot count.
    pub fn job_track_in_progress(&self) -> String {
        self.key("track:inprogress")
    }

    /// Sorted set of executions spawned from one periodic policy, score = run_at.
    pub fn upstream_job_and_executions(&self, upstream_job_id: &str) -> String {
        self.key(format_args!("executions:{}", upstream_job_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queues
    // ─────────────────────────────────────────────────────────────────────────

    /// Prefix of every job queue; the job name completes it.
    pub fn jobs_prefix(&self) -> String {
        self.key("jobs:")
    }

    /// Pending queue of one job type.
    pub fn jobs(&self, job_type: &str) -> String {
        self.key(format_args!("jobs:{}", job_type))
    }

    /// In-progress list of one job type owned by one worker pool.
    pub fn in_progress_queue(&self, job_type: &str, pool_id: &str) -> String {
        self.key(format_args!("inprogress:{}:{}", job_type, pool_id))
    }

    /// Count of running jobs of one type across all pools.
    pub fn job_lock(&self, job_type: &str) -> String {
        self.key(format_args!("lock:{}", job_type))
    }

    /// Hash of running job counts of one type per worker pool.
    pub fn job_lock_info(&self, job_type: &str) -> String {
        self.key(format_args!("lock_info:{}", job_type))
    }

    pub fn job_paused(&self, job_type: &str) -> String {
        self.key(format_args!("paused:{}", job_type))
    }

    pub fn job_max_concurrency(&self, job_type: &str) -> String {
        self.key(format_args!("max_concurrency:{}", job_type))
    }

    /// Sorted set of delayed jobs, score = run_at.
    pub fn scheduled(&self) -> String {
        self.key("scheduled")
    }

    /// Sorted set of failed jobs waiting for another attempt, score = retry time.
    pub fn retry(&self) -> String {
        self.key("retry")
    }

    /// Sorted set of jobs that exhausted their attempts, score = failure time.
    pub fn dead(&self) -> String {
        self.key("dead")
    }

    pub fn known_jobs(&self) -> String {
        self.key("known_jobs")
    }

    /// Dedup key of a unique job; `params_json` is the canonical JSON of its parameters.
    pub fn unique_job(&self, job_name: &str, params_json: &str) -> String {
        self.key(format_args!("unique:running:{}:{}", job_name, params_json))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker pools
    // ─────────────────────────────────────────────────────────────────────────

    /// Set of worker pool IDs that heartbeat.
    pub fn worker_pools(&self) -> String {
        self.key("worker_pools")
    }

    /// Heartbeat hash of one worker pool.
    pub fn heartbeat(&self, pool_id: &str) -> String {
        self.key(format_args!("worker_pools:{}", pool_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hooks and retries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn hook_event_retry_queue(&self) -> String {
        self.key("hook_events")
    }

    /// Reserved for durable status retries; the lifecycle controller keeps them in memory.
    pub fn status_update_retry_queue(&self) -> String {
        self.key("status_change_events")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Periodic policies
    // ─────────────────────────────────────────────────────────────────────────

    /// Sorted set of policy JSON blobs, score = numeric policy ID.
    pub fn periodic_policy(&self) -> String {
        self.key("period:policies")
    }

    /// Pub/sub channel announcing policy changes.
    pub fn periodic_policy_notification(&self) -> String {
        self.key("period:policies:notifications")
    }

    pub fn periodic_lock(&self) -> String {
        self.key("period:lock")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Schema
    // ─────────────────────────────────────────────────────────────────────────

    pub fn schema_version(&self) -> String {
        self.key("_schema_version")
    }

    /// Held by the one process running migrations.
    pub fn schema_migration_lock(&self) -> String {
        self.key("_schema_version:lock")
    }
}
