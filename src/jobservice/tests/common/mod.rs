//! Shared fixtures for the Redis-backed integration tests.
//!
//! Tests run against `JOBSERVICE_TEST_REDIS_URL` (default `redis://127.0.0.1:6379`) in a
//! namespace of their own, and are skipped when Redis is unreachable.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jobservice_core::common::rds::{self, KeySpace, RedisPool};
use jobservice_core::common::utils::make_identifier;
use jobservice_core::common::Parameters;
use jobservice_core::config::{HookConfig, LifecycleConfig, PeriodConfig};
use jobservice_core::error::{JobServiceError, Result};
use jobservice_core::hook::{Agent, HookClient};
use jobservice_core::job::{ExecutionContext, Handler, HookCallback, Stats, Status};
use jobservice_core::lcm::Controller;
use jobservice_core::period::{PeriodicEnqueuer, PolicyStore, Scheduler};
use jobservice_core::runner::RedisJobRunner;
use jobservice_core::worker::{BasicWorker, Reaper, Registry, WorkerPool};

pub const SAMPLE_JOB: &str = "sample";

pub fn redis_url() -> String {
    std::env::var("JOBSERVICE_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// A connection in a fresh namespace, or `None` when Redis is unreachable.
pub async fn connect() -> Option<(RedisPool, KeySpace)> {
    let url = redis_url();
    let connecting = RedisPool::connect(&url);
    let redis = match tokio::time::timeout(Duration::from_secs(2), connecting).await {
        Ok(Ok(redis)) => redis,
        _ => {
            eprintln!("skipping: Redis is not reachable at {}", redis_url());
            return None;
        }
    };
    if redis.ping().await.is_err() {
        eprintln!("skipping: Redis at {} does not answer", redis_url());
        return None;
    }
    let keys = KeySpace::new(format!("{{jobservice_test_{}}}", make_identifier()));
    Some((redis, keys))
}

/// Delete every key of the namespace.
pub async fn flush_namespace(redis: &RedisPool, keys: &KeySpace) {
    let mut conn = redis.conn();
    let found = rds::scan_keys(&mut conn, &format!("{}*", keys.prefix()))
        .await
        .unwrap_or_default();
    if !found.is_empty() {
        let _: std::result::Result<i64, _> =
            redis::cmd("DEL").arg(&found).query_async(&mut conn).await;
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Counts its runs and ends as configured.
#[derive(Clone)]
pub struct SampleJob {
    pub calls: Arc<AtomicUsize>,
    pub fail_with: Option<&'static str>,
    pub retry: bool,
}

impl SampleJob {
    pub fn succeeding(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            fail_with: None,
            retry: true,
        }
    }

    pub fn failing(calls: Arc<AtomicUsize>, retry: bool) -> Self {
        Self {
            calls,
            fail_with: Some("sample failure"),
            retry,
        }
    }
}

#[async_trait]
impl Handler for SampleJob {
    fn max_fails(&self) -> u32 {
        3
    }

    fn should_retry(&self) -> bool {
        self.retry
    }

    fn validate(&self, _params: &Parameters) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &ExecutionContext, _params: &Parameters) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(msg) => Err(JobServiceError::handler_failed(msg)),
            None => Ok(()),
        }
    }
}

/// Panics on every run and never asks for a retry.
pub struct PanickingJob;

#[async_trait]
impl Handler for PanickingJob {
    fn max_fails(&self) -> u32 {
        3
    }

    fn should_retry(&self) -> bool {
        false
    }

    fn validate(&self, _params: &Parameters) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &ExecutionContext, _params: &Parameters) -> Result<()> {
        panic!("sample handler blew up");
    }
}

/// Runs until the op command says stop, for at most ten seconds.
#[derive(Clone)]
pub struct StoppableJob {
    pub started: Arc<AtomicBool>,
    pub stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for StoppableJob {
    fn max_fails(&self) -> u32 {
        1
    }

    fn should_retry(&self) -> bool {
        false
    }

    fn validate(&self, _params: &Parameters) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &ExecutionContext, _params: &Parameters) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if ctx.op_command().await.is_stop() {
                self.stopped.store(true, Ordering::SeqCst);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// The job service assembled over one test namespace, without its loops running.
pub struct Harness {
    pub keys: KeySpace,
    pub redis: RedisPool,
    pub agent: Arc<Agent>,
    pub controller: Arc<Controller>,
    pub periodic: Arc<PeriodicEnqueuer>,
    pub registry: Arc<Registry>,
    pub pool: Arc<WorkerPool>,
    pub worker: Arc<BasicWorker>,
    pub reaper: Reaper,
    pub shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn new() -> Option<Self> {
        let (redis, keys) = connect().await?;

        let hook = HookConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            ..HookConfig::default()
        };
        let agent = Arc::new(Agent::new(
            keys.clone(),
            redis.clone(),
            HookClient::new(&hook).expect("hook client"),
        ));
        let callback: Arc<dyn HookCallback> = agent.clone();
        let controller = Arc::new(Controller::new(
            keys.clone(),
            redis.clone(),
            Some(callback),
            LifecycleConfig::default(),
        ));

        let store = Arc::new(PolicyStore::new(keys.clone(), redis.clone()));
        let periodic = Arc::new(PeriodicEnqueuer::new(
            keys.clone(),
            redis.clone(),
            Arc::clone(&store),
            Arc::clone(&controller),
            PeriodConfig::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            keys.clone(),
            redis.clone(),
            store,
            Arc::clone(&periodic),
            Arc::clone(&controller),
        ));

        let registry = Arc::new(Registry::new());
        let runner = Arc::new(RedisJobRunner::new(Arc::clone(&controller), Arc::clone(&registry)));
        let pool = Arc::new(WorkerPool::new(
            None,
            2,
            keys.clone(),
            redis.clone(),
            Arc::clone(&registry),
            runner,
        ));
        let worker = Arc::new(BasicWorker::new(
            keys.clone(),
            redis.clone(),
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&controller),
            scheduler,
        ));
        let reaper = Reaper::new(
            keys.clone(),
            redis.clone(),
            Arc::clone(&controller),
            Arc::clone(&registry),
        );

        Some(Self {
            keys,
            redis,
            agent,
            controller,
            periodic,
            registry,
            pool,
            worker,
            reaper,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Start the worker pool only; hook resends and the reaper are driven by the tests.
    pub async fn start_pool(&mut self) {
        let handles = self.pool.start(self.shutdown.clone()).await.expect("pool start");
        self.handles.extend(handles);
    }

    /// Poll the stats of `job_id` until they reach `status`.
    pub async fn wait_for_status(&self, job_id: &str, status: Status) -> Stats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let stats = self.worker.get_job(job_id).await.expect("job stats");
            if stats.status == status {
                return stats;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {} waiting for {}",
                job_id,
                stats.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn zcard(&self, key: &str) -> i64 {
        let mut conn = self.redis.conn();
        redis::cmd("ZCARD").arg(key).query_async(&mut conn).await.expect("ZCARD")
    }

    pub async fn llen(&self, key: &str) -> i64 {
        let mut conn = self.redis.conn();
        redis::cmd("LLEN").arg(key).query_async(&mut conn).await.expect("LLEN")
    }

    pub async fn is_tracked(&self, job_id: &str) -> bool {
        let mut conn = self.redis.conn();
        redis::cmd("HEXISTS")
            .arg(self.keys.job_track_in_progress())
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .expect("HEXISTS")
    }

    pub async fn teardown(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        flush_namespace(&self.redis, &self.keys).await;
    }
}
