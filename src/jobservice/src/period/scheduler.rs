use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::enqueuer::{self, PeriodicEnqueuer};
use super::policy::{Notification, NotificationEvent, Policy};
use super::store::{read_policies, PolicyStore, StoredPolicy};
use crate::common::rds::{KeySpace, RedisPool};
use crate::common::utils::now_unix;
use crate::error::Result;
use crate::lcm::Controller;
use crate::worker::job::remove_scheduled;

/// Schedules and cancels periodic policies.
pub struct Scheduler {
    keys: KeySpace,
    redis: RedisPool,
    store: Arc<PolicyStore>,
    enqueuer: Arc<PeriodicEnqueuer>,
    controller: Arc<Controller>,
}

impl Scheduler {
    pub fn new(
        keys: KeySpace,
        redis: RedisPool,
        store: Arc<PolicyStore>,
        enqueuer: Arc<PeriodicEnqueuer>,
        controller: Arc<Controller>,
    ) -> Self {
        Self {
            keys,
            redis,
            store,
            enqueuer,
            controller,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Load the policies and launch the watcher and the enqueuer.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let count = self.store.load().await?;
        tracing::info!(policies = count, "Periodic scheduler started");
        Ok(vec![
            self.store.serve(shutdown.clone()),
            self.enqueuer.serve(shutdown),
        ])
    }

    /// Store `policy` and schedule its first firings; returns its numeric ID.
    ///
    /// Older policies of a well-known job with identical parameters are removed.
    pub async fn schedule(&self, policy: &Policy) -> Result<i64> {
        policy.validate()?;
        let raw = policy.to_json()?;

        let lock = enqueuer::lock(&self.keys, &self.redis).await?;
        let result = self.schedule_locked(policy, &raw).await;
        lock.release(&self.redis).await?;
        let numeric_id = result?;

        self.refresh_and_notify(NotificationEvent::Schedule, &policy.id).await;
        tracing::info!(
            policy_id = %policy.id,
            numeric_id,
            job_name = %policy.job_name,
            cron = %policy.cron_spec,
            "Periodic policy scheduled"
        );
        Ok(numeric_id)
    }

    async fn schedule_locked(&self, policy: &Policy, raw: &str) -> Result<i64> {
        for existing in read_policies(&self.keys, &self.redis).await? {
            if existing.policy.id == policy.id || existing.policy.duplicates(policy) {
                tracing::warn!(
                    policy_id = %existing.policy.id,
                    job_name = %existing.policy.job_name,
                    "Replacing duplicated periodic policy"
                );
                self.remove_locked(&existing).await?;
            }
        }

        let mut conn = self.redis.conn();
        let key = self.keys.periodic_policy();
        let mut numeric_id = now_unix();
        loop {
            let taken: i64 = redis::cmd("ZCOUNT")
                .arg(&key)
                .arg(numeric_id)
                .arg(numeric_id)
                .query_async(&mut conn)
                .await?;
            if taken == 0 {
                break;
            }
            numeric_id += 1;
        }

        redis::cmd("ZADD")
            .arg(&key)
            .arg(numeric_id)
            .arg(raw)
            .query_async::<_, i64>(&mut conn)
            .await?;

        if let Err(e) = self.enqueuer.enqueue_policy(numeric_id, policy).await {
            tracing::error!(
                policy_id = %policy.id,
                error = %e,
                "First enqueue of periodic policy failed"
            );
        }
        Ok(numeric_id)
    }

    /// Remove policy `policy_id` and stop its pending executions.
    ///
    /// An unknown policy is not an error.
    pub async fn unschedule(&self, policy_id: &str) -> Result<()> {
        let lock = enqueuer::lock(&self.keys, &self.redis).await?;
        let result = self.unschedule_locked(policy_id).await;
        lock.release(&self.redis).await?;
        result?;

        self.refresh_and_notify(NotificationEvent::Unschedule, policy_id).await;
        tracing::info!(policy_id, "Periodic policy unscheduled");
        Ok(())
    }

    async fn unschedule_locked(&self, policy_id: &str) -> Result<()> {
        let found = read_policies(&self.keys, &self.redis)
            .await?
            .into_iter()
            .find(|s| s.policy.id == policy_id);

        match found {
            Some(stored) => self.remove_locked(&stored).await,
            None => {
                tracing::warn!(policy_id, "Periodic policy to unschedule not found");
                self.stop_executions(policy_id).await
            }
        }
    }

    async fn remove_locked(&self, stored: &StoredPolicy) -> Result<()> {
        let mut conn = self.redis.conn();
        redis::cmd("ZREM")
            .arg(self.keys.periodic_policy())
            .arg(&stored.raw)
            .query_async::<_, i64>(&mut conn)
            .await?;
        self.stop_executions(&stored.policy.id).await
    }

    /// Stop every pending execution of a policy and the policy's own stats.
    async fn stop_executions(&self, policy_id: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        let pending: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.upstream_job_and_executions(policy_id))
            .arg("(0")
            .arg("+inf")
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        for (execution_id, run_at) in pending {
            remove_scheduled(&mut conn, &self.keys, run_at as i64, policy_id).await?;
            self.stop_tracked(&execution_id).await?;
        }
        self.stop_tracked(policy_id).await
    }

    async fn stop_tracked(&self, job_id: &str) -> Result<()> {
        let tracker = match self.controller.track(job_id).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if tracker.job().status.is_final() {
            return Ok(());
        }
        match tracker.stop().await {
            Err(e) if e.is_status_mismatch() || e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn refresh_and_notify(&self, event: NotificationEvent, policy_id: &str) {
        if let Err(e) = self.store.load().await {
            tracing::warn!(error = %e, "Failed to refresh periodic policies");
        }

        let notification = Notification {
            event,
            id: policy_id.to_string(),
        };
        let publish = async {
            let payload = serde_json::to_string(&notification)?;
            let mut conn = self.redis.conn();
            redis::cmd("PUBLISH")
                .arg(self.keys.periodic_policy_notification())
                .arg(payload)
                .query_async::<_, i64>(&mut conn)
                .await?;
            Ok::<_, crate::error::JobServiceError>(())
        };
        if let Err(e) = publish.await {
            tracing::warn!(policy_id, error = %e, "Failed to publish policy notification");
        }
    }
}
