//! Per-job lifecycle tracker.
//!
//! A [`Tracker`] wraps the stats hash of one job. Every status write goes through the
//! `SET_STATUS`/`STATUS_RESET` scripts so the stats hash and the in-progress tracking hash
//! move together; the tracker only mirrors the result in memory and fires hook events.

use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;

use super::event::{HookCallback, SimpleStatusChange, StatusChange};
use super::stats::{fields, Stats};
use super::status::{Kind, Status};
use crate::common::rds::{self, scripts, KeySpace, RedisPool};
use crate::common::utils::now_unix;
use crate::common::SyncList;
use crate::error::{JobServiceError, Result};

/// Safety TTL of a non-periodic stats record at save time.
pub const STATS_SAFETY_TTL_SECS: i64 = 7 * 24 * 3600;

/// Everything a tracker needs besides its job: shared by all trackers of a process.
#[derive(Clone)]
pub struct TrackerEnv {
    pub keys: KeySpace,
    pub redis: RedisPool,
    pub retry_list: Arc<SyncList<SimpleStatusChange>>,
    pub callback: Option<Arc<dyn HookCallback>>,
}

impl std::fmt::Debug for TrackerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerEnv")
            .field("namespace", &self.keys.namespace())
            .field("retry_list_len", &self.retry_list.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Handle on the stats of one job.
#[derive(Debug)]
pub struct Tracker {
    env: TrackerEnv,
    job_id: String,
    stats: RwLock<Stats>,
}

impl Tracker {
    /// Wrap a stats record that is not persisted yet (see [`Tracker::save`]).
    pub fn with_stats(env: TrackerEnv, stats: Stats) -> Self {
        Self {
            env,
            job_id: stats.job_id.clone(),
            stats: RwLock::new(stats),
        }
    }

    /// Load the persisted stats of `job_id`; NotFound when absent.
    pub async fn load(env: TrackerEnv, job_id: &str) -> Result<Self> {
        let stats = retrieve(&env, job_id).await?;
        Ok(Self {
            env,
            job_id: job_id.to_string(),
            stats: RwLock::new(stats),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// A copy of the in-memory stats.
    pub fn job(&self) -> Stats {
        self.stats.read().clone()
    }

    fn stats_key(&self) -> String {
        self.env.keys.job_stats(&self.job_id)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist the initial stats hash.
    ///
    /// Non-periodic records get [`STATS_SAFETY_TTL_SECS`] (plus the delay of a scheduled
    /// job) and take two track slots. Executions of a periodic policy are linked to it.
    pub async fn save(&self) -> Result<()> {
        let stats = self.job();
        stats.validate()?;
        if !stats.status.is_initial() {
            return Err(JobServiceError::bad_request(format!(
                "Job {} cannot be saved in status {}",
                stats.job_id, stats.status
            )));
        }

        let key = self.stats_key();
        let now = now_unix();
        let mut pipe = redis::pipe();
        pipe.atomic();

        let hset = pipe.cmd("HSET").arg(&key);
        for (field, value) in stats.to_fields()? {
            hset.arg(field).arg(value);
        }
        hset.arg(fields::UPDATE_TIME).arg(now).ignore();

        if stats.job_kind != Kind::Periodic {
            let mut ttl = STATS_SAFETY_TTL_SECS;
            if stats.job_kind == Kind::Scheduled && stats.run_at > now {
                ttl += stats.run_at - now;
            }
            // spread expirations of bulk-enqueued jobs
            ttl += rand::rng().random_range(0..15);
            pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
            pipe.cmd("HSET")
                .arg(self.env.keys.job_track_in_progress())
                .arg(&self.job_id)
                .arg(scripts::TRACK_SLOTS)
                .ignore();
        } else {
            // a re-scheduled policy may reuse the ID of a stopped one
            pipe.cmd("PERSIST").arg(&key).ignore();
        }

        if stats.is_periodic_execution() {
            pipe.cmd("ZADD")
                .arg(self.env.keys.upstream_job_and_executions(&stats.upstream_job_id))
                .arg("NX")
                .arg(stats.run_at)
                .arg(&self.job_id)
                .ignore();
        }

        let mut conn = self.env.redis.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.stats.write().update_time = now;
        Ok(())
    }

    /// Reload the in-memory stats from Redis.
    pub async fn refresh(&self) -> Result<()> {
        let stats = retrieve(&self.env, &self.job_id).await?;
        *self.stats.write() = stats;
        Ok(())
    }

    /// The persisted status, re-read on every call.
    pub async fn status(&self) -> Result<Status> {
        let mut conn = self.env.redis.conn();
        let values = rds::hm_get(&mut conn, &self.stats_key(), &[fields::STATUS]).await?;
        match values.into_iter().next().flatten() {
            Some(raw) => raw.parse::<Status>(),
            None => Err(JobServiceError::not_found("job", self.job_id.as_str())),
        }
    }

    /// Write arbitrary stats fields; `update_time` is always refreshed.
    pub async fn update(&self, values: &[(&str, String)]) -> Result<()> {
        if values.is_empty() {
            return Err(JobServiceError::bad_request("No properties specified to update"));
        }
        let mut conn = self.env.redis.conn();
        rds::hm_set(&mut conn, &self.stats_key(), values).await
    }

    /// Numeric ID of the periodic policy this record belongs to.
    pub fn numeric_id(&self) -> Result<i64> {
        let pid = self.stats.read().numeric_pid;
        if pid > 0 {
            Ok(pid)
        } else {
            Err(JobServiceError::not_found("numeric policy id", self.job_id.as_str()))
        }
    }

    /// Mark this periodic execution as done by setting its score in the
    /// policy's executions set to -1.
    pub async fn periodic_execution_done(&self) -> Result<()> {
        let upstream = self.stats.read().upstream_job_id.clone();
        if upstream.is_empty() {
            return Err(JobServiceError::bad_request(format!(
                "{} is not a periodic job execution",
                self.job_id
            )));
        }

        let mut conn = self.env.redis.conn();
        redis::cmd("ZADD")
            .arg(self.env.keys.upstream_job_and_executions(&upstream))
            .arg("XX")
            .arg(-1)
            .arg(&self.job_id)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn run(&self) -> Result<()> {
        self.transition(Status::Running).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.transition(Status::Stopped).await
    }

    pub async fn succeed(&self) -> Result<()> {
        self.transition(Status::Success).await
    }

    pub async fn fail(&self) -> Result<()> {
        self.transition(Status::Error).await
    }

    /// Move to `target` at the current revision.
    ///
    /// A status mismatch comes back as a typed error. A transport failure queues the
    /// change on the retry list and counts as applied.
    async fn transition(&self, target: Status) -> Result<()> {
        let revision = self.stats.read().revision;
        match self.compare_and_set(target, revision).await {
            Ok(()) => {}
            Err(e) if e.is_status_mismatch() || e.is_not_found() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    status = %target,
                    error = %e,
                    "Status update failed, queued for retry"
                );
                let change = SimpleStatusChange {
                    job_id: self.job_id.clone(),
                    target_status: target,
                    revision,
                };
                if let Some(dropped) = self.env.retry_list.push(change) {
                    tracing::error!(
                        job_id = %dropped.job_id,
                        status = %dropped.target_status,
                        "Status retry list is full, dropped the oldest entry"
                    );
                }
            }
        }

        self.refresh_local(target, None);
        self.fire_hook(target, None);
        Ok(())
    }

    /// Run `SET_STATUS` for `(target, revision)`.
    pub async fn compare_and_set(&self, target: Status, revision: i64) -> Result<()> {
        let mut conn = self.env.redis.conn();
        let reply: String = scripts::set_status()
            .key(self.stats_key())
            .key(self.env.keys.job_track_in_progress())
            .arg(target.as_str())
            .arg(revision)
            .arg(now_unix())
            .arg(&self.job_id)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            scripts::REPLY_OK => Ok(()),
            scripts::REPLY_NOT_FOUND => {
                Err(JobServiceError::not_found("job", self.job_id.as_str()))
            }
            "invalid" => Err(JobServiceError::invalid_status(target.as_str())),
            current => Err(JobServiceError::status_mismatch(
                self.job_id.as_str(),
                current,
                target.as_str(),
            )),
        }
    }

    /// Restart the job at `start` with a fresh revision, clearing ACK and check-in.
    pub async fn reset(&self, start: Status) -> Result<()> {
        if !start.is_initial() {
            return Err(JobServiceError::invalid_status(start.as_str()));
        }

        let now = now_unix();
        let mut conn = self.env.redis.conn();
        let revision: i64 = scripts::status_reset()
            .key(self.stats_key())
            .key(self.env.keys.job_track_in_progress())
            .arg(&self.job_id)
            .arg(start.as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        if revision < 0 {
            return Err(JobServiceError::not_found("job", self.job_id.as_str()));
        }

        let mut stats = self.stats.write();
        stats.status = start;
        stats.revision = revision;
        stats.update_time = now;
        stats.hook_ack = None;
        stats.check_in.clear();
        stats.check_in_at = 0;
        Ok(())
    }

    /// Record a progress message and notify the web hook.
    pub async fn check_in(&self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(JobServiceError::bad_request("Check in error: empty message"));
        }

        let now = now_unix();
        self.update(&[
            (fields::CHECK_IN, message.to_string()),
            (fields::CHECK_IN_AT, now.to_string()),
        ])
        .await?;

        let current = self.stats.read().status;
        self.refresh_local(current, Some((message, now)));
        self.fire_hook(current, Some(message.to_string()));
        Ok(())
    }

    fn refresh_local(&self, status: Status, check_in: Option<(&str, i64)>) {
        let mut stats = self.stats.write();
        stats.status = status;
        stats.update_time = now_unix();
        if let Some((message, at)) = check_in {
            stats.check_in = message.to_string();
            stats.check_in_at = at;
        }
    }

    /// Hand the current stats to the hook callback without waiting for delivery.
    ///
    /// A no-op for jobs without a web hook or when no callback is installed.
    pub fn fire_hook(&self, status: Status, check_in: Option<String>) {
        let Some(callback) = self.env.callback.clone() else {
            return;
        };
        let stats = self.job();
        if !stats.has_web_hook() {
            return;
        }

        let url = stats.web_hook_url.clone();
        let change = StatusChange {
            job_id: self.job_id.clone(),
            status,
            check_in,
            metadata: Some(stats),
        };

        tokio::spawn(async move {
            if let Err(e) = callback.on_status_change(&url, change).await {
                tracing::warn!(url = %url, error = %e, "Hook callback failed");
            }
        });
    }
}

async fn retrieve(env: &TrackerEnv, job_id: &str) -> Result<Stats> {
    let mut conn = env.redis.conn();
    let values = rds::hget_all(&mut conn, &env.keys.job_stats(job_id)).await?;
    Stats::from_fields(job_id, &values)
}
