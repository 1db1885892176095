//! End-to-end tests of the job lifecycle against a live Redis.
//!
//! Tests cover:
//! - Generic jobs running to success
//! - Failing handlers with and without retry
//! - Stopping scheduled jobs before they run
//! - Webhook delivery, retry and ACK
//! - Reaping in-progress work of dead worker pools
//! - Unique jobs and periodic policies

mod common;

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{Harness, PanickingJob, SampleJob, StoppableJob, SAMPLE_JOB};
use jobservice_core::common::Parameters;
use jobservice_core::config::PeriodConfig;
use jobservice_core::job::{Kind, Status};
use jobservice_core::period::{PeriodicEnqueuer, PolicyStore};
use jobservice_core::worker::{Enqueuer, QueuedJob, NO_RETRY_FAILS};

fn params(value: Value) -> Parameters {
    value.as_object().cloned().expect("object")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Generic Jobs
// ============================================================================

#[tokio::test]
async fn test_generic_job_runs_to_success() {
    let Some(mut h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::succeeding(Arc::clone(&counter)))
        .unwrap();
    h.start_pool().await;

    let stats = h.worker.enqueue(SAMPLE_JOB, params(json!({"x": 1})), false, "").await.unwrap();
    assert_eq!(stats.status, Status::Pending);
    assert_eq!(stats.job_kind, Kind::Generic);
    assert_eq!(stats.parameters, Some(params(json!({"x": 1}))));

    h.wait_for_status(&stats.job_id, Status::Success).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!h.is_tracked(&stats.job_id).await);

    let hr = &h;
    let in_progress = h.keys.in_progress_queue(SAMPLE_JOB, h.pool.pool_id());
    let key = in_progress.as_str();
    eventually("in-progress list to drain", || async move { hr.llen(key).await == 0 }).await;

    let mut conn = h.redis.conn();
    let ttl: i64 = redis::cmd("TTL")
        .arg(h.keys.job_stats(&stats.job_id))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 86_400, "unexpected ttl {}", ttl);

    h.teardown().await;
}

#[tokio::test]
async fn test_failing_job_without_retry_goes_dead() {
    let Some(mut h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::failing(Arc::clone(&counter), false))
        .unwrap();
    h.start_pool().await;

    let stats = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, "").await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Error).await;

    let hr = &h;
    let dead = h.keys.dead();
    let key = dead.as_str();
    eventually("job in the dead set", || async move { hr.zcard(key).await == 1 }).await;

    let mut conn = h.redis.conn();
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg(&dead)
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    let job = QueuedJob::from_json(&members[0]).unwrap();
    assert_eq!(job.id, stats.job_id);
    assert_eq!(job.fails, NO_RETRY_FAILS);
    assert!(job.err.contains("sample failure"));

    assert_eq!(h.zcard(&h.keys.retry()).await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.teardown().await;
}

#[tokio::test]
async fn test_panicking_handler_ends_in_error_and_goes_dead() {
    let Some(mut h) = Harness::new().await else { return };
    h.registry.register(SAMPLE_JOB, || PanickingJob).unwrap();
    h.start_pool().await;

    let stats = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, "").await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Error).await;

    let hr = &h;
    let dead = h.keys.dead();
    let key = dead.as_str();
    eventually("job in the dead set", || async move { hr.zcard(key).await == 1 }).await;

    let mut conn = h.redis.conn();
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg(&dead)
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    let job = QueuedJob::from_json(&members[0]).unwrap();
    assert_eq!(job.id, stats.job_id);
    assert_eq!(job.fails, NO_RETRY_FAILS);
    assert!(job.err.contains("Runtime error: sample handler blew up"), "{}", job.err);
    assert_eq!(h.zcard(&h.keys.retry()).await, 0);

    // the worker survives the panic
    let next = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, "").await.unwrap();
    h.wait_for_status(&next.job_id, Status::Error).await;

    h.teardown().await;
}

#[tokio::test]
async fn test_stopping_running_job_reaches_handler() {
    let Some(mut h) = Harness::new().await else { return };
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let job = StoppableJob {
        started: Arc::clone(&started),
        stopped: Arc::clone(&stopped),
    };
    h.registry.register(SAMPLE_JOB, move || job.clone()).unwrap();
    h.start_pool().await;

    let stats = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, "").await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Running).await;
    let flag = Arc::clone(&started);
    eventually("handler started", || {
        let flag = Arc::clone(&flag);
        async move { flag.load(Ordering::SeqCst) }
    })
    .await;

    h.worker.stop_job(&stats.job_id).await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Stopped).await;

    let flag = Arc::clone(&stopped);
    eventually("handler saw the stop", || {
        let flag = Arc::clone(&flag);
        async move { flag.load(Ordering::SeqCst) }
    })
    .await;

    // the handler returned cleanly, the status stays put
    let hr = &h;
    let lock = h.keys.job_lock(SAMPLE_JOB);
    let key = lock.as_str();
    eventually("job lock released", || async move {
        let mut conn = hr.redis.conn();
        let held: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await.unwrap();
        held.unwrap_or(0) == 0
    })
    .await;
    assert_eq!(h.worker.get_job(&stats.job_id).await.unwrap().status, Status::Stopped);
    assert_eq!(h.zcard(&h.keys.dead()).await, 0);

    h.teardown().await;
}

#[tokio::test]
async fn test_failing_job_with_retry_waits_in_retry_set() {
    let Some(mut h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::failing(Arc::clone(&counter), true))
        .unwrap();
    h.start_pool().await;

    let stats = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, "").await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Error).await;

    let hr = &h;
    let retry = h.keys.retry();
    let key = retry.as_str();
    eventually("job in the retry set", || async move { hr.zcard(key).await == 1 }).await;

    let mut conn = h.redis.conn();
    let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
        .arg(&retry)
        .arg(0)
        .arg(-1)
        .arg("WITHSCORES")
        .query_async(&mut conn)
        .await
        .unwrap();
    let job = QueuedJob::from_json(&members[0].0).unwrap();
    assert_eq!(job.fails, 1);
    assert!(job.failed_at > 0);
    // first backoff is at least 1 + 15 seconds away
    assert!(members[0].1 as i64 >= job.failed_at + 16);
    assert_eq!(h.zcard(&h.keys.dead()).await, 0);

    h.teardown().await;
}

// ============================================================================
// Scheduled Jobs
// ============================================================================

#[tokio::test]
async fn test_stopped_scheduled_job_never_runs() {
    let Some(mut h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::succeeding(Arc::clone(&counter)))
        .unwrap();
    h.start_pool().await;

    let stats = h.worker.schedule(SAMPLE_JOB, Parameters::new(), 120, false, "").await.unwrap();
    assert_eq!(stats.status, Status::Scheduled);
    assert_eq!(stats.job_kind, Kind::Scheduled);
    assert!(stats.run_at >= stats.enqueue_time + 119);
    assert_eq!(h.zcard(&h.keys.scheduled()).await, 1);

    h.worker.stop_job(&stats.job_id).await.unwrap();

    let stopped = h.worker.get_job(&stats.job_id).await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert_eq!(h.zcard(&h.keys.scheduled()).await, 0);

    // past one requeue round
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.llen(&h.keys.jobs(SAMPLE_JOB)).await, 0);

    // stopping a finished job is a no-op
    h.worker.stop_job(&stats.job_id).await.unwrap();

    h.teardown().await;
}

#[tokio::test]
async fn test_unique_job_rejects_duplicate() {
    let Some(h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::succeeding(Arc::clone(&counter)))
        .unwrap();

    let args = params(json!({"repository": "library/nginx", "tag": "1.25"}));
    let first = h.worker.enqueue(SAMPLE_JOB, args.clone(), true, "").await.unwrap();
    assert!(first.is_unique);

    let err = h.worker.enqueue(SAMPLE_JOB, args, true, "").await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.llen(&h.keys.jobs(SAMPLE_JOB)).await, 1);

    // different parameters are a different job
    h.worker
        .enqueue(SAMPLE_JOB, params(json!({"repository": "library/redis"})), true, "")
        .await
        .unwrap();
    assert_eq!(h.llen(&h.keys.jobs(SAMPLE_JOB)).await, 2);

    h.teardown().await;
}

#[tokio::test]
async fn test_unknown_job_is_rejected() {
    let Some(h) = Harness::new().await else { return };

    let err = h.worker.enqueue("missing", Parameters::new(), false, "").await.unwrap_err();
    assert!(!err.is_conflict());
    assert!(h.worker.is_known_job("missing").is_none());
    assert!(h.worker.get_job("").await.is_err());

    h.teardown().await;
}

#[tokio::test]
async fn test_due_jobs_move_to_their_queue() {
    let Some(h) = Harness::new().await else { return };
    let enqueuer = Enqueuer::new(h.keys.clone(), h.redis.clone());

    let args = params(json!({"x": 2}));
    let delayed = enqueuer.enqueue_unique_in(SAMPLE_JOB, 60, args.clone()).await.unwrap();
    assert!(delayed.run_at.is_some());
    assert!(enqueuer.enqueue_unique_in(SAMPLE_JOB, 60, args).await.unwrap_err().is_conflict());

    let due = enqueuer.enqueue_in(SAMPLE_JOB, 0, Parameters::new()).await.unwrap();
    assert_eq!(h.zcard(&h.keys.scheduled()).await, 2);

    assert_eq!(h.pool.requeue_due(&h.keys.scheduled()).await.unwrap(), 1);
    assert_eq!(h.zcard(&h.keys.scheduled()).await, 1);

    let mut conn = h.redis.conn();
    let queued: Vec<String> = redis::cmd("LRANGE")
        .arg(h.keys.jobs(SAMPLE_JOB))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(QueuedJob::from_json(&queued[0]).unwrap().id, due.job_id);

    h.teardown().await;
}

// ============================================================================
// Webhooks
// ============================================================================

#[tokio::test]
async fn test_webhook_retry_after_failure() {
    let Some(mut h) = Harness::new().await else { return };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.registry
        .register(SAMPLE_JOB, move || SampleJob::succeeding(Arc::clone(&counter)))
        .unwrap();
    h.start_pool().await;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let url = format!("{}/hook", server.uri());

    let stats = h.worker.enqueue(SAMPLE_JOB, Parameters::new(), false, &url).await.unwrap();
    h.wait_for_status(&stats.job_id, Status::Success).await;

    // Running and Success were both attempted
    let srv = &server;
    eventually("two hook deliveries", || async move {
        srv.received_requests().await.map_or(0, |r| r.len()) >= 2
    })
    .await;
    let hr = &h;
    let queue = h.keys.hook_event_retry_queue();
    let key = queue.as_str();
    eventually("a queued hook event", || async move { hr.zcard(key).await >= 1 }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    for _ in 0..10 {
        match h.agent.resend_once().await {
            Ok(_) => continue,
            Err(e) if e.is_no_elements() => break,
            Err(e) => panic!("resend failed: {}", e),
        }
    }
    assert_eq!(h.zcard(&queue).await, 0);

    let acked = h.worker.get_job(&stats.job_id).await.unwrap();
    let ack = acked.hook_ack.expect("hook ack");
    assert_eq!(ack.status, Status::Success);
    assert_eq!(ack.revision, acked.revision);
    assert!(!h.is_tracked(&stats.job_id).await);

    h.teardown().await;
}

// ============================================================================
// Reaper
// ============================================================================

#[tokio::test]
async fn test_reaper_requeues_work_of_dead_pool() {
    let Some(h) = Harness::new().await else { return };
    let ghost = "ghost-pool";
    let raw = QueuedJob::new(SAMPLE_JOB, Parameters::new()).to_json().unwrap();

    let mut conn = h.redis.conn();
    redis::pipe()
        .cmd("SADD")
        .arg(h.keys.known_jobs())
        .arg(SAMPLE_JOB)
        .ignore()
        .cmd("LPUSH")
        .arg(h.keys.in_progress_queue(SAMPLE_JOB, ghost))
        .arg(&raw)
        .ignore()
        .cmd("SET")
        .arg(h.keys.job_lock(SAMPLE_JOB))
        .arg(1)
        .ignore()
        .cmd("HSET")
        .arg(h.keys.job_lock_info(SAMPLE_JOB))
        .arg(ghost)
        .arg(1)
        .ignore()
        .query_async::<_, ()>(&mut conn)
        .await
        .unwrap();

    let moved = h.reaper.reenqueue_in_progress_jobs().await.unwrap();
    assert_eq!(moved, 1);

    assert_eq!(h.llen(&h.keys.in_progress_queue(SAMPLE_JOB, ghost)).await, 0);
    let queued: Vec<String> = redis::cmd("LRANGE")
        .arg(h.keys.jobs(SAMPLE_JOB))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(queued, vec![raw]);

    let lock: i64 = redis::cmd("GET")
        .arg(h.keys.job_lock(SAMPLE_JOB))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(lock, 0);
    let info: Option<i64> = redis::cmd("HGET")
        .arg(h.keys.job_lock_info(SAMPLE_JOB))
        .arg(ghost)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(info, None);

    // a second pass finds nothing
    assert_eq!(h.reaper.reenqueue_in_progress_jobs().await.unwrap(), 0);
    assert_eq!(h.llen(&h.keys.jobs(SAMPLE_JOB)).await, 1);

    h.teardown().await;
}

#[tokio::test]
async fn test_reaper_leaves_live_pool_alone() {
    let Some(h) = Harness::new().await else { return };
    h.pool.heartbeat().await.unwrap();
    let pool_id = h.pool.pool_id().to_string();
    let raw = QueuedJob::new(SAMPLE_JOB, Parameters::new()).to_json().unwrap();

    let mut conn = h.redis.conn();
    redis::pipe()
        .cmd("SADD")
        .arg(h.keys.known_jobs())
        .arg(SAMPLE_JOB)
        .ignore()
        .cmd("LPUSH")
        .arg(h.keys.in_progress_queue(SAMPLE_JOB, &pool_id))
        .arg(&raw)
        .ignore()
        .cmd("HSET")
        .arg(h.keys.job_lock_info(SAMPLE_JOB))
        .arg(&pool_id)
        .arg(1)
        .ignore()
        .query_async::<_, ()>(&mut conn)
        .await
        .unwrap();

    assert_eq!(h.reaper.reenqueue_in_progress_jobs().await.unwrap(), 0);
    assert_eq!(h.llen(&h.keys.in_progress_queue(SAMPLE_JOB, &pool_id)).await, 1);

    let pools = h.worker.stats().await.unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].worker_pool_id, pool_id);

    h.teardown().await;
}

// ============================================================================
// Periodic Policies
// ============================================================================

#[tokio::test]
async fn test_unscheduled_policy_leaves_no_firings() {
    let Some(h) = Harness::new().await else { return };
    h.registry
        .register(SAMPLE_JOB, || SampleJob::succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap();

    let stats = h
        .worker
        .periodically_enqueue(SAMPLE_JOB, params(json!({"x": 1})), "0 * * * * *", "")
        .await
        .unwrap();
    assert_eq!(stats.job_kind, Kind::Periodic);
    assert_eq!(stats.status, Status::Scheduled);
    assert!(stats.numeric_pid > 0);

    let scheduled = h.keys.scheduled();
    assert!(h.zcard(&scheduled).await >= 1);

    let mut conn = h.redis.conn();
    let executions: Vec<String> = redis::cmd("ZRANGE")
        .arg(h.keys.upstream_job_and_executions(&stats.job_id))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(!executions.is_empty());

    h.worker.stop_job(&stats.job_id).await.unwrap();

    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg(&scheduled)
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(members
        .iter()
        .filter_map(|raw| QueuedJob::from_json(raw).ok())
        .all(|job| job.id != stats.job_id));

    for execution in executions {
        let exec = h.worker.get_job(&execution).await.unwrap();
        assert_eq!(exec.status, Status::Stopped);
        assert_eq!(exec.upstream_job_id, stats.job_id);
    }
    let policy = h.worker.get_job(&stats.job_id).await.unwrap();
    assert_eq!(policy.status, Status::Stopped);

    h.teardown().await;
}

#[tokio::test]
async fn test_enqueuer_with_stale_cache_skips_unscheduled_policy() {
    let Some(h) = Harness::new().await else { return };
    h.registry
        .register(SAMPLE_JOB, || SampleJob::succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap();

    let stats = h
        .worker
        .periodically_enqueue(SAMPLE_JOB, params(json!({"x": 1})), "0 * * * * *", "")
        .await
        .unwrap();

    // a second process whose policy cache never hears about the unschedule
    let peer_store = Arc::new(PolicyStore::new(h.keys.clone(), h.redis.clone()));
    assert_eq!(peer_store.load().await.unwrap(), 1);
    let peer = PeriodicEnqueuer::new(
        h.keys.clone(),
        h.redis.clone(),
        Arc::clone(&peer_store),
        Arc::clone(&h.controller),
        PeriodConfig::default(),
    );

    h.worker.stop_job(&stats.job_id).await.unwrap();
    assert!(peer_store.get(&stats.job_id).is_some());

    assert_eq!(peer.enqueue_round().await.unwrap(), 0);
    assert!(peer_store.get(&stats.job_id).is_none());

    let mut conn = h.redis.conn();
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg(h.keys.scheduled())
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(members
        .iter()
        .filter_map(|raw| QueuedJob::from_json(raw).ok())
        .all(|job| job.id != stats.job_id));

    h.teardown().await;
}
