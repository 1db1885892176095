//! Recovery of work left behind by dead pools and reconciliation of hung stats.

use metrics::counter;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pool::read_heartbeats;
use super::registry::Registry;
use crate::common::rds::{self, scripts, KeySpace, RedisPool};
use crate::common::utils::now_unix;
use crate::error::Result;
use crate::job::{Stats, Status};
use crate::lcm::Controller;

const REENQUEUE_DELAY: Duration = Duration::from_secs(5);
const SYNC_FIRST_DELAY: Duration = Duration::from_secs(5 * 60);
const SYNC_INTERVAL: Duration = Duration::from_secs(3600);
/// Pools with an older heartbeat are dead.
pub const LIVE_POOL_HEARTBEAT_SECS: i64 = 5 * 60;
/// Ongoing jobs without an update for this long are failed.
pub const MAX_UPDATE_SECS: i64 = 24 * 3600;

/// Order of the persisted status relative to its ACK by `(revision, status, check_in_at)`.
///
/// A job without a web hook has nothing to ACK and always compares equal; a missing ACK
/// means the ACK lags.
pub fn compare_with_ack(stats: &Stats) -> Ordering {
    if !stats.has_web_hook() {
        return Ordering::Equal;
    }
    let Some(ack) = &stats.hook_ack else {
        return Ordering::Greater;
    };
    stats
        .revision
        .cmp(&ack.revision)
        .then(stats.status.code().cmp(&ack.status.code()))
        .then(stats.check_in_at.cmp(&ack.check_in_at))
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub untracked: usize,
    pub failed: usize,
    pub refired: usize,
    pub rolled_forward: usize,
}

pub struct Reaper {
    keys: KeySpace,
    redis: RedisPool,
    controller: Arc<Controller>,
    registry: Arc<Registry>,
}

impl Reaper {
    pub fn new(
        keys: KeySpace,
        redis: RedisPool,
        controller: Arc<Controller>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            keys,
            redis,
            controller,
            registry,
        }
    }

    /// Job types to reap: registered here or seen by any producer.
    async fn job_types(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.conn();
        let known: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.known_jobs())
            .query_async(&mut conn)
            .await?;
        let mut types: Vec<String> = known.into_iter().chain(self.registry.names()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    /// Move in-progress jobs of dead pools back to their queues; returns how many moved.
    pub async fn reenqueue_in_progress_jobs(&self) -> Result<usize> {
        let now = now_unix();
        let heartbeats = read_heartbeats(&self.keys, &self.redis).await?;
        let live: HashSet<String> = heartbeats
            .iter()
            .filter(|p| now - p.heartbeat_at < LIVE_POOL_HEARTBEAT_SECS)
            .map(|p| p.worker_pool_id.clone())
            .collect();
        let mut dead: BTreeSet<String> = heartbeats
            .iter()
            .filter(|p| !live.contains(&p.worker_pool_id))
            .map(|p| p.worker_pool_id.clone())
            .collect();

        let job_types = self.job_types().await?;
        let mut conn = self.redis.conn();
        for job_type in &job_types {
            let locks = match rds::hscan_all(&mut conn, &self.keys.job_lock_info(job_type)).await {
                Ok(locks) => locks,
                Err(e) => {
                    tracing::error!(job_type = %job_type, error = %e, "Failed to scan lock info");
                    continue;
                }
            };
            for (pool_id, count) in locks {
                let count: i64 = match count.parse() {
                    Ok(n) => n,
                    Err(_) => {
                        tracing::warn!(
                            job_type = %job_type,
                            pool_id = %pool_id,
                            value = %count,
                            "Malformed lock info"
                        );
                        continue;
                    }
                };
                if count > 0 && !live.contains(&pool_id) {
                    dead.insert(pool_id);
                }
            }
        }

        let mut moved = 0;
        for pool_id in &dead {
            match self.requeue_pool(pool_id, &job_types).await {
                Ok(n) => {
                    moved += n;
                    self.forget_pool(pool_id).await?;
                    tracing::info!(pool_id = %pool_id, requeued = n, "Reaped dead worker pool");
                }
                Err(e) => tracing::error!(
                    pool_id = %pool_id,
                    error = %e,
                    "Failed to reap dead worker pool"
                ),
            }
        }
        Ok(moved)
    }

    async fn requeue_pool(&self, pool_id: &str, job_types: &[String]) -> Result<usize> {
        if job_types.is_empty() {
            return Ok(0);
        }

        let mut script = scripts::reenqueue_in_progress().prepare_invoke();
        for job_type in job_types {
            script
                .key(self.keys.in_progress_queue(job_type, pool_id))
                .key(self.keys.jobs(job_type))
                .key(self.keys.job_lock(job_type))
                .key(self.keys.job_lock_info(job_type));
        }
        script.arg(pool_id);

        let mut conn = self.redis.conn();
        let mut moved = 0;
        loop {
            let reply: Option<(String, String, String)> = script.invoke_async(&mut conn).await?;
            let Some((_, from, to)) = reply else {
                return Ok(moved);
            };
            tracing::debug!(pool_id, from = %from, to = %to, "Requeued in-progress job");
            counter!("jobservice_reaper_requeued_total").increment(1);
            moved += 1;
        }
    }

    async fn forget_pool(&self, pool_id: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.worker_pools())
            .arg(pool_id)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.heartbeat(pool_id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Walk the in-progress tracking hash and repair each entry.
    pub async fn sync_outdated_stats(&self) -> Result<SyncReport> {
        let mut conn = self.redis.conn();
        let tracked = rds::hscan_all(&mut conn, &self.keys.job_track_in_progress()).await?;

        let mut report = SyncReport::default();
        for (job_id, _slots) in tracked {
            if let Err(e) = self.sync_one(&job_id, &mut report).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to reconcile job stats");
            }
        }
        tracing::info!(?report, "Outdated job stats reconciled");
        Ok(report)
    }

    async fn sync_one(&self, job_id: &str, report: &mut SyncReport) -> Result<()> {
        let tracker = match self.controller.track(job_id).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                self.untrack(job_id).await?;
                report.untracked += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let stats = tracker.job();

        match compare_with_ack(&stats) {
            Ordering::Equal if stats.status.is_final() => {
                self.untrack(job_id).await?;
                report.untracked += 1;
            }
            Ordering::Equal => {
                let last = if stats.status == Status::Scheduled {
                    stats.update_time.max(stats.run_at)
                } else {
                    stats.update_time
                };
                if now_unix() - last > MAX_UPDATE_SECS {
                    match tracker.fail().await {
                        Ok(()) => {
                            tracing::info!(
                                job_id,
                                status = %stats.status,
                                "Marked hung job as failed"
                            );
                            report.failed += 1;
                        }
                        Err(e) if e.is_status_mismatch() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Ordering::Greater => {
                tracker.fire_hook(stats.status, None);
                tracing::info!(
                    job_id,
                    status = %stats.status,
                    revision = stats.revision,
                    "Re-fired unacknowledged hook event"
                );
                report.refired += 1;
            }
            Ordering::Less => {
                if let Some(ack) = &stats.hook_ack {
                    match tracker.compare_and_set(ack.status, ack.revision).await {
                        Ok(()) => {
                            tracing::info!(
                                job_id,
                                status = %ack.status,
                                "Rolled status forward to its ACK"
                            );
                            report.rolled_forward += 1;
                        }
                        Err(e) if e.is_status_mismatch() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    async fn untrack(&self, job_id: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        redis::cmd("HDEL")
            .arg(self.keys.job_track_in_progress())
            .arg(job_id)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Reap dead pools once shortly after start, then reconcile stats every hour.
    pub fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let reenqueue = {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(REENQUEUE_DELAY) => {}
                }
                match this.reenqueue_in_progress_jobs().await {
                    Ok(n) => tracing::info!(requeued = n, "In-progress jobs of dead pools reaped"),
                    Err(e) => tracing::error!(error = %e, "Failed to reap in-progress jobs"),
                }
            })
        };

        let sync = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tracing::info!("Reaper started");
                let mut wait = SYNC_FIRST_DELAY;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    wait = SYNC_INTERVAL;
                    if let Err(e) = this.sync_outdated_stats().await {
                        tracing::error!(error = %e, "Reaper sync failed");
                    }
                }
                tracing::info!("Reaper stopped");
            })
        };

        vec![reenqueue, sync]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AckHook;

    fn stats(status: Status, revision: i64, ack: Option<(Status, i64)>) -> Stats {
        let mut stats = Stats::new("job1", "sample");
        stats.status = status;
        stats.revision = revision;
        stats.web_hook_url = "http://hooks.local/cb".into();
        stats.hook_ack = ack.map(|(status, revision)| AckHook {
            status,
            revision,
            check_in_at: 0,
        });
        stats
    }

    #[test]
    fn test_missing_ack_lags() {
        assert_eq!(compare_with_ack(&stats(Status::Running, 1, None)), Ordering::Greater);
    }

    #[test]
    fn test_compare_with_ack_order() {
        assert_eq!(
            compare_with_ack(&stats(Status::Success, 1, Some((Status::Success, 1)))),
            Ordering::Equal
        );
        assert_eq!(
            compare_with_ack(&stats(Status::Success, 1, Some((Status::Running, 1)))),
            Ordering::Greater
        );
        assert_eq!(
            compare_with_ack(&stats(Status::Running, 1, Some((Status::Error, 1)))),
            Ordering::Less
        );
        // revision dominates status
        assert_eq!(
            compare_with_ack(&stats(Status::Pending, 2, Some((Status::Error, 1)))),
            Ordering::Greater
        );
    }

    #[test]
    fn test_no_web_hook_always_equal() {
        let mut s = stats(Status::Running, 1, None);
        s.web_hook_url.clear();
        assert_eq!(compare_with_ack(&s), Ordering::Equal);
    }
}
