//! Worker pool: fetches jobs, runs them and settles them in the retry or dead set.
//!
//! A job is moved atomically from `jobs:<type>` to `inprogress:<type>:<pool>` by the
//! fetch script, which also takes a slot in `lock:<type>` and `lock_info:<type>`. The
//! slot is given back in the same MULTI that removes the job from the in-progress list.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job::{QueuedJob, NO_RETRY_FAILS};
use super::registry::{JobSpec, Registry};
use crate::common::rds::{scripts, KeySpace, RedisPool};
use crate::common::utils::{host_name, make_identifier, now_unix};
use crate::error::{JobServiceError, Result};
use crate::runner::RedisJobRunner;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const REQUEUE_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MIN_IDLE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_IDLE_BACKOFF: Duration = Duration::from_secs(1);
/// Entries kept in the dead set.
pub const DEAD_SET_LIMIT: i64 = 1000;
/// A pool whose heartbeat is older than this is reported Dead.
pub const HEALTHY_HEARTBEAT_SECS: i64 = 10;

/// Seconds until the next attempt after `fails` failures.
pub fn retry_backoff(fails: i64) -> i64 {
    let fails = fails.clamp(0, 1_000);
    fails.pow(4) + 15 + rand::rng().random_range(0..30) * (fails + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PoolStatus {
    Healthy,
    Dead,
}

/// Heartbeat of one worker pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub worker_pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: u32,
    pub host: String,
    pub pid: u32,
    pub status: PoolStatus,
}

impl PoolStats {
    fn from_fields(pool_id: &str, fields: &HashMap<String, String>, now: i64) -> Self {
        let int = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let heartbeat_at = int("heartbeat_at");
        Self {
            worker_pool_id: pool_id.to_string(),
            started_at: int("started_at"),
            heartbeat_at,
            job_names: fields
                .get("job_names")
                .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            concurrency: u32::try_from(int("concurrency")).unwrap_or(0),
            host: fields.get("host").cloned().unwrap_or_default(),
            pid: u32::try_from(int("pid")).unwrap_or(0),
            status: if now - heartbeat_at <= HEALTHY_HEARTBEAT_SECS {
                PoolStatus::Healthy
            } else {
                PoolStatus::Dead
            },
        }
    }
}

/// Heartbeats of every pool in `<ns>:worker_pools`, sorted by pool ID.
pub async fn read_heartbeats(keys: &KeySpace, redis: &RedisPool) -> Result<Vec<PoolStats>> {
    let mut conn = redis.conn();
    let mut ids: Vec<String> = redis::cmd("SMEMBERS")
        .arg(keys.worker_pools())
        .query_async(&mut conn)
        .await?;
    ids.sort();

    let now = now_unix();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(keys.heartbeat(&id))
            .query_async(&mut conn)
            .await?;
        out.push(PoolStats::from_fields(&id, &fields, now));
    }
    Ok(out)
}

/// Order job types by weighted sampling on their priority, without replacement.
fn sample_order<R: Rng>(specs: &[Arc<JobSpec>], rng: &mut R) -> Vec<Arc<JobSpec>> {
    let mut left = specs.to_vec();
    let mut out = Vec::with_capacity(left.len());
    while !left.is_empty() {
        let total: u64 = left.iter().map(|s| u64::from(s.priority.max(1))).sum();
        let mut pick = rng.random_range(0..total);
        let idx = left
            .iter()
            .position(|s| {
                let weight = u64::from(s.priority.max(1));
                if pick < weight {
                    true
                } else {
                    pick -= weight;
                    false
                }
            })
            .unwrap_or(0);
        out.push(left.swap_remove(idx));
    }
    out
}

/// A job taken from its queue, with the raw member left in the in-progress list.
struct Fetched {
    raw: String,
    job_type: String,
    job: Option<QueuedJob>,
}

pub struct WorkerPool {
    pool_id: String,
    concurrency: usize,
    keys: KeySpace,
    redis: RedisPool,
    registry: Arc<Registry>,
    runner: Arc<RedisJobRunner>,
    specs: OnceLock<Vec<Arc<JobSpec>>>,
    started_at: AtomicI64,
}

impl WorkerPool {
    pub fn new(
        pool_id: Option<String>,
        concurrency: usize,
        keys: KeySpace,
        redis: RedisPool,
        registry: Arc<Registry>,
        runner: Arc<RedisJobRunner>,
    ) -> Self {
        Self {
            pool_id: pool_id.unwrap_or_else(make_identifier),
            concurrency: concurrency.max(1),
            keys,
            redis,
            registry,
            runner,
            specs: OnceLock::new(),
            started_at: AtomicI64::new(0),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn started_at(&self) -> i64 {
        self.started_at.load(Ordering::SeqCst)
    }

    /// Close registration, publish handler limits and launch workers, requeuers and
    /// the heartbeater.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.registry.close();
        let specs = self.registry.specs();
        if specs.is_empty() {
            tracing::warn!(pool_id = %self.pool_id, "Worker pool started without registered jobs");
        }
        self.publish_limits(&specs).await?;
        self.specs
            .set(specs)
            .map_err(|_| JobServiceError::registration("Worker pool already started"))?;

        self.started_at.store(now_unix(), Ordering::SeqCst);
        self.heartbeat().await?;

        let mut handles = Vec::with_capacity(self.concurrency + 3);
        for worker_id in 0..self.concurrency {
            let this = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { this.work(worker_id, token).await }));
        }
        handles.push(self.serve_requeuer(self.keys.scheduled(), shutdown.clone()));
        handles.push(self.serve_requeuer(self.keys.retry(), shutdown.clone()));
        handles.push(self.serve_heartbeat(shutdown));

        tracing::info!(
            pool_id = %self.pool_id,
            concurrency = self.concurrency,
            jobs = ?self.registry.names(),
            "Worker pool started"
        );
        Ok(handles)
    }

    async fn publish_limits(&self, specs: &[Arc<JobSpec>]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for spec in specs {
            pipe.cmd("SADD").arg(self.keys.known_jobs()).arg(&spec.name).ignore();
            let key = self.keys.job_max_concurrency(&spec.name);
            if spec.max_concurrency > 0 {
                pipe.cmd("SET").arg(key).arg(spec.max_concurrency).ignore();
            } else {
                pipe.cmd("DEL").arg(key).ignore();
            }
        }
        let mut conn = self.redis.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Workers
    // ═══════════════════════════════════════════════════════════════════════════

    async fn work(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        tracing::debug!(pool_id = %self.pool_id, worker_id, "Worker started");
        let mut idle = MIN_IDLE_BACKOFF;
        while !shutdown.is_cancelled() {
            let wait = match self.fetch().await {
                Ok(Some(fetched)) => {
                    idle = MIN_IDLE_BACKOFF;
                    self.process(fetched, &shutdown).await;
                    continue;
                }
                Ok(None) => {
                    let wait = idle;
                    idle = (idle * 2).min(MAX_IDLE_BACKOFF);
                    wait
                }
                Err(e) => {
                    tracing::error!(
                        pool_id = %self.pool_id,
                        worker_id,
                        error = %e,
                        "Failed to fetch job"
                    );
                    FETCH_ERROR_BACKOFF
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(pool_id = %self.pool_id, worker_id, "Worker stopped");
    }

    async fn fetch(&self) -> Result<Option<Fetched>> {
        let Some(specs) = self.specs.get() else {
            return Ok(None);
        };
        if specs.is_empty() {
            return Ok(None);
        }

        let order = sample_order(specs, &mut rand::rng());
        let mut script = scripts::fetch_job().prepare_invoke();
        for spec in &order {
            script
                .key(self.keys.jobs(&spec.name))
                .key(self.keys.in_progress_queue(&spec.name, &self.pool_id))
                .key(self.keys.job_paused(&spec.name))
                .key(self.keys.job_lock(&spec.name))
                .key(self.keys.job_lock_info(&spec.name))
                .key(self.keys.job_max_concurrency(&spec.name));
        }
        script.arg(&self.pool_id);

        let mut conn = self.redis.conn();
        let reply: Option<(String, String, String)> = script.invoke_async(&mut conn).await?;
        let Some((raw, from, _)) = reply else {
            return Ok(None);
        };

        let job_type = from
            .strip_prefix(&self.keys.jobs_prefix())
            .unwrap_or(&from)
            .to_string();
        let job = match QueuedJob::from_json(&raw) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::error!(job_type = %job_type, error = %e, "Fetched an undecodable job");
                None
            }
        };
        Ok(Some(Fetched { raw, job_type, job }))
    }

    async fn process(&self, fetched: Fetched, shutdown: &CancellationToken) {
        let outcome = match fetched.job {
            Some(mut job) => {
                let max_fails = self.registry.get(&job.name).map(|s| s.max_fails).unwrap_or(1);
                match self.runner.run(&mut job, shutdown.clone()).await {
                    Ok(()) => self.complete(&fetched.raw, &fetched.job_type, &job).await,
                    Err(e) => {
                        if job.err.is_empty() {
                            job.err = e.to_string();
                        }
                        self.fail(&fetched.raw, &fetched.job_type, job, max_fails).await
                    }
                }
            }
            None => self.bury_raw(&fetched.raw, &fetched.job_type).await,
        };

        if let Err(e) = outcome {
            tracing::error!(
                pool_id = %self.pool_id,
                job_type = %fetched.job_type,
                error = %e,
                "Failed to settle job"
            );
        }
    }

    /// Commands giving back the in-progress entry and its lock slot.
    fn release_pipe(&self, raw: &str, job_type: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.keys.in_progress_queue(job_type, &self.pool_id))
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("DECR")
            .arg(self.keys.job_lock(job_type))
            .ignore()
            .cmd("HINCRBY")
            .arg(self.keys.job_lock_info(job_type))
            .arg(&self.pool_id)
            .arg(-1)
            .ignore();
        pipe
    }

    async fn complete(&self, raw: &str, job_type: &str, job: &QueuedJob) -> Result<()> {
        let mut pipe = self.release_pipe(raw, job_type);
        if let Some(key) = &job.unique_key {
            pipe.cmd("DEL").arg(key).ignore();
        }
        let mut conn = self.redis.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Count the failure and move the job to the retry set, or to the dead set once its
    /// attempts are used up. The dedup key of a unique job is held while it waits for retry.
    async fn fail(
        &self,
        raw: &str,
        job_type: &str,
        mut job: QueuedJob,
        max_fails: i64,
    ) -> Result<()> {
        let now = now_unix();
        if job.fails < NO_RETRY_FAILS {
            job.fails += 1;
        }
        job.failed_at = now;
        let retry = job.fails < max_fails;
        let updated = job.to_json()?;

        let mut pipe = self.release_pipe(raw, job_type);
        if retry {
            let at = now + retry_backoff(job.fails);
            pipe.cmd("ZADD").arg(self.keys.retry()).arg(at).arg(updated).ignore();
            tracing::info!(
                job_id = %job.id,
                job_name = %job.name,
                fails = job.fails,
                retry_at = at,
                "Job scheduled for retry"
            );
        } else {
            self.push_dead(&mut pipe, now, &updated);
            if let Some(key) = &job.unique_key {
                pipe.cmd("DEL").arg(key).ignore();
            }
            tracing::warn!(
                job_id = %job.id,
                job_name = %job.name,
                fails = job.fails,
                "Job moved to the dead set"
            );
        }

        let mut conn = self.redis.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn bury_raw(&self, raw: &str, job_type: &str) -> Result<()> {
        let mut pipe = self.release_pipe(raw, job_type);
        self.push_dead(&mut pipe, now_unix(), raw);
        let mut conn = self.redis.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    fn push_dead(&self, pipe: &mut redis::Pipeline, now: i64, raw: &str) {
        let dead = self.keys.dead();
        pipe.cmd("ZADD").arg(&dead).arg(now).arg(raw).ignore();
        pipe.cmd("ZREMRANGEBYRANK")
            .arg(&dead)
            .arg(0)
            .arg(-(DEAD_SET_LIMIT + 1))
            .ignore();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Requeuers and heartbeat
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move every due entry of `set` to its job queue; returns how many moved.
    pub async fn requeue_due(&self, set: &str) -> Result<usize> {
        let prefix = self.keys.jobs_prefix();
        let mut conn = self.redis.conn();
        let mut moved = 0;
        loop {
            let reply: Option<String> = scripts::requeue_due()
                .key(set)
                .arg(&prefix)
                .arg(now_unix())
                .invoke_async(&mut conn)
                .await?;
            match reply {
                None => return Ok(moved),
                Some(name) if name == "invalid" => {
                    tracing::warn!(set, "Dropped an undecodable entry while requeuing");
                }
                Some(name) => {
                    tracing::debug!(set, job_name = %name, "Requeued due job");
                    moved += 1;
                }
            }
        }
    }

    fn serve_requeuer(
        self: &Arc<Self>,
        set: String,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.requeue_due(&set).await {
                    tracing::warn!(set = %set, error = %e, "Requeue round failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REQUEUE_INTERVAL) => {}
                }
            }
        })
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let names = self.registry.names().join(",");
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.worker_pools())
            .arg(&self.pool_id)
            .ignore()
            .cmd("HSET")
            .arg(self.keys.heartbeat(&self.pool_id))
            .arg("heartbeat_at")
            .arg(now_unix())
            .arg("started_at")
            .arg(self.started_at())
            .arg("job_names")
            .arg(names)
            .arg("concurrency")
            .arg(self.concurrency)
            .arg("host")
            .arg(host_name())
            .arg("pid")
            .arg(std::process::id())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_heartbeat(&self) -> Result<()> {
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.worker_pools())
            .arg(&self.pool_id)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.heartbeat(&self.pool_id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    fn serve_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                }
                if let Err(e) = this.heartbeat().await {
                    tracing::warn!(pool_id = %this.pool_id, error = %e, "Heartbeat failed");
                }
            }
            if let Err(e) = this.remove_heartbeat().await {
                tracing::warn!(pool_id = %this.pool_id, error = %e, "Failed to remove heartbeat");
            }
            tracing::info!(pool_id = %this.pool_id, "Worker pool stopped");
        })
    }
}
