//! The worker façade used by the rest of the service.
//!
//! Every enqueue writes the stats record before the job reaches a queue, so a fast
//! worker always finds it.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::enqueuer::Enqueuer;
use super::job::{remove_scheduled, QueuedJob};
use super::pool::{read_heartbeats, PoolStats, WorkerPool};
use super::reaper::Reaper;
use super::registry::Registry;
use crate::common::rds::{KeySpace, RedisPool};
use crate::common::utils::{make_identifier, now_unix};
use crate::common::Parameters;
use crate::error::{JobServiceError, Result};
use crate::job::{ref_link, Handler, Kind, Stats, Status};
use crate::lcm::Controller;
use crate::period::{Policy, Scheduler};
use crate::telemetry::redact_params;

const READY_ATTEMPTS: u32 = 10;
const READY_INTERVAL: Duration = Duration::from_secs(1);

pub struct BasicWorker {
    keys: KeySpace,
    redis: RedisPool,
    registry: Arc<Registry>,
    enqueuer: Enqueuer,
    pool: Arc<WorkerPool>,
    reaper: Arc<Reaper>,
    controller: Arc<Controller>,
    scheduler: Arc<Scheduler>,
}

impl BasicWorker {
    pub fn new(
        keys: KeySpace,
        redis: RedisPool,
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        controller: Arc<Controller>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let reaper = Arc::new(Reaper::new(
            keys.clone(),
            redis.clone(),
            Arc::clone(&controller),
            Arc::clone(&registry),
        ));
        Self {
            enqueuer: Enqueuer::new(keys.clone(), redis.clone()),
            keys,
            redis,
            registry,
            pool,
            reaper,
            controller,
            scheduler,
        }
    }

    pub fn pool_id(&self) -> &str {
        self.pool.pool_id()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Wait for Redis, then launch the pool, the reaper and the periodic scheduler.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.redis.wait_ready(READY_ATTEMPTS, READY_INTERVAL).await?;

        let mut handles = self.pool.start(shutdown.clone()).await?;
        handles.extend(self.reaper.serve(shutdown.clone()));
        handles.extend(self.scheduler.start(shutdown).await?);
        Ok(handles)
    }

    pub fn register_job<H, F>(&self, name: &str, factory: F) -> Result<()>
    where
        H: Handler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register(name, factory)
    }

    /// Name of the handler type registered as `name`.
    pub fn is_known_job(&self, name: &str) -> Option<&'static str> {
        self.registry.get(name).map(|s| s.type_name)
    }

    /// Run the handler's own parameter check on a fresh instance.
    pub fn validate_job_parameters(&self, name: &str, params: &Parameters) -> Result<()> {
        let spec = self
            .registry
            .get(name)
            .ok_or_else(|| JobServiceError::unknown_job(name))?;
        (spec.factory)().validate(params)
    }

    pub async fn enqueue(
        &self,
        name: &str,
        params: Parameters,
        unique: bool,
        web_hook_url: &str,
    ) -> Result<Stats> {
        self.validate_job_parameters(name, &params)?;

        let mut job = QueuedJob::new(name, params.clone());
        let mut stats = new_stats(&job, Kind::Generic, unique, web_hook_url, params);
        stats.status = Status::Pending;
        let tracker = self.controller.new_tracker(stats).await?;

        let pushed = if unique {
            self.enqueuer.push_unique(&mut job).await
        } else {
            self.enqueuer.push(&job).await
        };
        self.settle_push(&job, pushed).await?;

        tracing::info!(
            job_id = %job.id,
            job_name = name,
            params = %redact_params(&job.args),
            "Job enqueued"
        );
        Ok(tracker.job())
    }

    /// Enqueue to run after `delay_secs`; the stats come back Scheduled with `run_at` set.
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        delay_secs: i64,
        unique: bool,
        web_hook_url: &str,
    ) -> Result<Stats> {
        self.validate_job_parameters(name, &params)?;

        let mut job = QueuedJob::new(name, params.clone());
        let run_at = now_unix() + delay_secs.max(0);
        let mut stats = new_stats(&job, Kind::Scheduled, unique, web_hook_url, params);
        stats.status = Status::Scheduled;
        stats.run_at = run_at;
        let tracker = self.controller.new_tracker(stats).await?;

        let pushed = if unique {
            self.enqueuer.push_unique_in(&mut job, run_at).await
        } else {
            self.enqueuer.push_in(&job, run_at).await
        };
        self.settle_push(&job, pushed).await?;

        tracing::info!(job_id = %job.id, job_name = name, run_at, "Job scheduled");
        Ok(tracker.job())
    }

    /// Create a periodic policy; the stats carry its numeric policy ID.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron_spec: &str,
        web_hook_url: &str,
    ) -> Result<Stats> {
        self.validate_job_parameters(name, &params)?;

        let policy = Policy {
            id: make_identifier(),
            job_name: name.to_string(),
            cron_spec: cron_spec.to_string(),
            job_params: Some(params.clone()),
            web_hook_url: web_hook_url.to_string(),
            cron_type: None,
        };
        let numeric_id = self.scheduler.schedule(&policy).await?;

        let now = now_unix();
        let mut stats = Stats::new(&policy.id, name);
        stats.job_kind = Kind::Periodic;
        stats.status = Status::Scheduled;
        stats.enqueue_time = now;
        stats.run_at = now;
        stats.cron_spec = policy.cron_spec.clone();
        stats.numeric_pid = numeric_id;
        stats.web_hook_url = policy.web_hook_url.clone();
        stats.ref_link = ref_link(&policy.id);
        stats.parameters = Some(params);

        match self.controller.new_tracker(stats).await {
            Ok(tracker) => Ok(tracker.job()),
            Err(e) => {
                if let Err(undo) = self.scheduler.unschedule(&policy.id).await {
                    tracing::error!(
                        policy_id = %policy.id,
                        error = %undo,
                        "Failed to roll back periodic policy"
                    );
                }
                Err(e)
            }
        }
    }

    /// A failed push leaves no stats behind for a unique collision.
    async fn settle_push(&self, job: &QueuedJob, pushed: Result<()>) -> Result<()> {
        let Err(e) = pushed else {
            return Ok(());
        };
        if e.is_conflict() {
            let mut conn = self.redis.conn();
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(self.keys.job_stats(&job.id))
                .ignore()
                .cmd("HDEL")
                .arg(self.keys.job_track_in_progress())
                .arg(&job.id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Err(e)
    }

    /// Heartbeats of every known worker pool.
    pub async fn stats(&self) -> Result<Vec<PoolStats>> {
        read_heartbeats(&self.keys, &self.redis).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Stats> {
        if job_id.is_empty() {
            return Err(JobServiceError::bad_request("Empty job ID"));
        }
        Ok(self.controller.track(job_id).await?.job())
    }

    /// Stop a job. Periodic jobs are unscheduled, scheduled ones leave the scheduled set
    /// before being marked Stopped, running ones see `stop` on their next op-command poll.
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        if job_id.is_empty() {
            return Err(JobServiceError::bad_request("Empty job ID"));
        }

        let tracker = self.controller.track(job_id).await?;
        let stats = tracker.job();
        if stats.status.is_final() {
            tracing::debug!(
                job_id,
                status = %stats.status,
                "Job already finished, nothing to stop"
            );
            return Ok(());
        }

        match stats.job_kind {
            Kind::Periodic => return self.scheduler.unschedule(job_id).await,
            Kind::Scheduled => {
                // executions of a policy are queued under the policy ID
                let queued_id = if stats.is_periodic_execution() {
                    stats.upstream_job_id.as_str()
                } else {
                    job_id
                };
                let mut conn = self.redis.conn();
                if !remove_scheduled(&mut conn, &self.keys, stats.run_at, queued_id).await? {
                    tracing::debug!(job_id, "Scheduled entry already gone");
                }
            }
            Kind::Generic => {}
        }

        match tracker.stop().await {
            Err(e) if e.is_status_mismatch() => {
                tracing::debug!(job_id, error = %e, "Job finished before it could be stopped");
                Ok(())
            }
            other => other,
        }
    }
}

fn new_stats(
    job: &QueuedJob,
    kind: Kind,
    unique: bool,
    web_hook_url: &str,
    params: Parameters,
) -> Stats {
    let mut stats = Stats::new(&job.id, &job.name);
    stats.job_kind = kind;
    stats.is_unique = unique;
    stats.enqueue_time = job.enqueued_at;
    stats.web_hook_url = web_hook_url.to_string();
    stats.ref_link = ref_link(&job.id);
    stats.parameters = Some(params);
    stats
}
