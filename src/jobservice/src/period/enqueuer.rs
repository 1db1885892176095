//! Turns periodic policies into scheduled executions.
//!
//! Every round, the process holding `<ns>:period:lock` computes each policy's firings
//! within the horizon, saves an execution stats record per firing and adds the queued
//! job to `<ns>:scheduled`. Members are deterministic per `(policy, epoch)`, so a firing
//! seen by two rounds is only scheduled once.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::policy::Policy;
use super::store::PolicyStore;
use crate::common::rds::{self, KeySpace, RedisPool};
use crate::common::utils::{make_identifier, now_unix};
use crate::config::PeriodConfig;
use crate::error::{JobServiceError, Result};
use crate::job::{periodic_execution_id, ref_link, Kind, Stats, Status};
use crate::lcm::Controller;
use crate::worker::job::QueuedJob;

/// Lifetime of `<ns>:period:lock` when its holder dies.
const LOCK_TTL_MS: u64 = 60_000;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const LOCK_ATTEMPTS: u32 = 50;

/// Holder of `<ns>:period:lock`; release with [`PeriodLock::release`].
pub struct PeriodLock {
    key: String,
    token: String,
}

impl PeriodLock {
    pub async fn release(self, redis: &RedisPool) -> Result<()> {
        let mut conn = redis.conn();
        if !rds::release_lock(&mut conn, &self.key, &self.token).await? {
            tracing::warn!(key = %self.key, "Period lock expired before release");
        }
        Ok(())
    }
}

/// Take the period lock, once.
pub async fn try_lock(keys: &KeySpace, redis: &RedisPool) -> Result<Option<PeriodLock>> {
    let key = keys.periodic_lock();
    let token = make_identifier();
    let mut conn = redis.conn();
    if rds::acquire_lock(&mut conn, &key, &token, LOCK_TTL_MS).await? {
        Ok(Some(PeriodLock { key, token }))
    } else {
        Ok(None)
    }
}

/// Take the period lock, waiting for the current holder.
pub async fn lock(keys: &KeySpace, redis: &RedisPool) -> Result<PeriodLock> {
    for _ in 0..LOCK_ATTEMPTS {
        if let Some(lock) = try_lock(keys, redis).await? {
            return Ok(lock);
        }
        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
    }
    Err(JobServiceError::lock_unavailable(keys.periodic_lock()))
}

pub struct PeriodicEnqueuer {
    keys: KeySpace,
    redis: RedisPool,
    store: Arc<PolicyStore>,
    controller: Arc<Controller>,
    config: PeriodConfig,
}

impl PeriodicEnqueuer {
    pub fn new(
        keys: KeySpace,
        redis: RedisPool,
        store: Arc<PolicyStore>,
        controller: Arc<Controller>,
        config: PeriodConfig,
    ) -> Self {
        Self {
            keys,
            redis,
            store,
            controller,
            config,
        }
    }

    /// One round over the stored policies; skipped when another process holds the lock.
    /// Returns the number of executions scheduled.
    ///
    /// Policies are re-read from Redis under the lock, so a policy removed by
    /// [`Scheduler::unschedule`](super::Scheduler::unschedule) never fires again.
    pub async fn enqueue_round(&self) -> Result<usize> {
        let Some(lock) = try_lock(&self.keys, &self.redis).await? else {
            tracing::debug!("Period lock held elsewhere, skipping enqueue round");
            return Ok(0);
        };

        let result = self.enqueue_all().await;
        lock.release(&self.redis).await?;
        result
    }

    async fn enqueue_all(&self) -> Result<usize> {
        // the cached view may miss an unschedule whose notification is still in flight
        self.store.load().await?;

        let mut scheduled = 0;
        for (numeric_id, policy) in self.store.list() {
            match self.enqueue_policy(numeric_id, &policy).await {
                Ok(n) => scheduled += n,
                Err(e) => tracing::error!(
                    policy_id = %policy.id,
                    job_name = %policy.job_name,
                    error = %e,
                    "Failed to enqueue periodic executions"
                ),
            }
        }
        Ok(scheduled)
    }

    /// Schedule the firings of one policy within the horizon. The caller holds the lock.
    pub async fn enqueue_policy(&self, numeric_id: i64, policy: &Policy) -> Result<usize> {
        let now = now_unix();
        let from = DateTime::<Utc>::from_timestamp(now, 0)
            .ok_or_else(|| JobServiceError::internal(format!("Bad timestamp {}", now)))?;
        let horizon = chrono::Duration::from_std(self.config.horizon)
            .map_err(|e| JobServiceError::configuration(e.to_string()))?;

        let mut scheduled = 0;
        for epoch in policy.firings_between(from, from + horizon)? {
            if self.schedule_execution(numeric_id, policy, epoch, now).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    async fn schedule_execution(
        &self,
        numeric_id: i64,
        policy: &Policy,
        epoch: i64,
        now: i64,
    ) -> Result<bool> {
        let execution_id = periodic_execution_id(&policy.id, epoch);
        let mut conn = self.redis.conn();

        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.job_stats(&execution_id))
            .query_async(&mut conn)
            .await?;
        if !exists {
            let mut stats = Stats::new(&execution_id, &policy.job_name);
            stats.job_kind = Kind::Scheduled;
            stats.status = Status::Scheduled;
            stats.enqueue_time = now;
            stats.run_at = epoch;
            stats.numeric_pid = numeric_id;
            stats.upstream_job_id = policy.id.clone();
            stats.web_hook_url = policy.web_hook_url.clone();
            stats.ref_link = ref_link(&execution_id);
            stats.parameters = policy.job_params.clone();
            self.controller.new_tracker(stats).await?;
        }

        let job =
            QueuedJob::periodic_execution(&policy.id, &policy.job_name, policy.params(), epoch);
        let added: i64 = redis::cmd("ZADD")
            .arg(self.keys.scheduled())
            .arg("NX")
            .arg(epoch)
            .arg(job.to_json()?)
            .query_async(&mut conn)
            .await?;

        if added > 0 {
            tracing::info!(
                policy_id = %policy.id,
                job_name = %policy.job_name,
                execution_id = %execution_id,
                run_at = epoch,
                "Periodic execution scheduled"
            );
        }
        Ok(added > 0)
    }

    /// Run enqueue rounds until `shutdown` is cancelled.
    pub fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                interval = ?this.config.enqueue_interval,
                horizon = ?this.config.horizon,
                "Periodic enqueuer started"
            );
            loop {
                match this.enqueue_round().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(scheduled = n, "Periodic enqueue round done"),
                    Err(e) => tracing::error!(error = %e, "Periodic enqueue round failed"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.config.enqueue_interval) => {}
                }
            }
            tracing::info!("Periodic enqueuer stopped");
        })
    }
}
