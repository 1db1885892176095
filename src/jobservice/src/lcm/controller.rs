use metrics::gauge;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::rds::{KeySpace, RedisPool};
use crate::common::SyncList;
use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::job::{HookCallback, SimpleStatusChange, Stats, Tracker, TrackerEnv};

/// Builds trackers and replays status writes that failed on transport errors.
pub struct Controller {
    env: TrackerEnv,
    config: LifecycleConfig,
}

impl Controller {
    pub fn new(
        keys: KeySpace,
        redis: RedisPool,
        callback: Option<Arc<dyn HookCallback>>,
        config: LifecycleConfig,
    ) -> Self {
        let retry_list = Arc::new(SyncList::new(config.retry_list_capacity));
        Self {
            env: TrackerEnv {
                keys,
                redis,
                retry_list,
                callback,
            },
            config,
        }
    }

    pub fn env(&self) -> &TrackerEnv {
        &self.env
    }

    pub fn retry_list(&self) -> &Arc<SyncList<SimpleStatusChange>> {
        &self.env.retry_list
    }

    /// Save `stats` and return its tracker.
    pub async fn new_tracker(&self, stats: Stats) -> Result<Arc<Tracker>> {
        let tracker = Tracker::with_stats(self.env.clone(), stats);
        tracker.save().await?;
        Ok(Arc::new(tracker))
    }

    /// Tracker of an existing job; NotFound when the stats are gone.
    pub async fn track(&self, job_id: &str) -> Result<Arc<Tracker>> {
        Ok(Arc::new(Tracker::load(self.env.clone(), job_id).await?))
    }

    /// Replay every queued status change once; returns how many are still pending.
    ///
    /// Entries leave the list when applied, when a newer status already exists or when
    /// the job is gone.
    pub async fn retry_pending(&self) -> usize {
        let mut settled = Vec::new();
        for change in self.env.retry_list.snapshot() {
            match self.apply(&change).await {
                Ok(()) => {
                    tracing::info!(
                        job_id = %change.job_id,
                        status = %change.target_status,
                        "Retried status update applied"
                    );
                    settled.push(change);
                }
                Err(e) if e.is_status_mismatch() || e.is_not_found() => {
                    tracing::debug!(
                        job_id = %change.job_id,
                        error = %e,
                        "Retried status update is obsolete"
                    );
                    settled.push(change);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %change.job_id,
                        status = %change.target_status,
                        error = %e,
                        "Status update still failing"
                    );
                }
            }
        }

        // one settled entry removes one queued copy; entries pushed meanwhile stay
        if !settled.is_empty() {
            self.env.retry_list.iterate(|queued| {
                match settled.iter().position(|c| c == queued) {
                    Some(index) => {
                        settled.swap_remove(index);
                        true
                    }
                    None => false,
                }
            });
        }

        let pending = self.env.retry_list.len();
        gauge!("jobservice_status_retries_pending").set(pending as f64);
        pending
    }

    async fn apply(&self, change: &SimpleStatusChange) -> Result<()> {
        let tracker = self.track(&change.job_id).await?;
        tracker
            .compare_and_set(change.target_status, change.revision)
            .await?;
        tracker.refresh().await?;
        tracker.fire_hook(change.target_status, None);
        Ok(())
    }

    /// Run the retry loop until `shutdown` is cancelled.
    pub fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Lifecycle controller retry loop started");
            loop {
                let wait = this.next_wait();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if !this.env.retry_list.is_empty() {
                    this.retry_pending().await;
                }
            }
            tracing::info!("Lifecycle controller retry loop stopped");
        })
    }

    fn next_wait(&self) -> Duration {
        let short_ms = self.config.short_loop_interval.as_millis() as u64;
        let jitter = if short_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..short_ms)
        };
        self.config.long_loop_interval + Duration::from_millis(jitter)
    }
}

