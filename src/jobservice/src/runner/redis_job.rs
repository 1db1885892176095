use futures::FutureExt;
use metrics::{counter, histogram};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::utils::now_unix;
use crate::error::{JobServiceError, Result};
use crate::job::{ExecutionContext, Handler, Status, Tracker};
use crate::lcm::Controller;
use crate::worker::job::{QueuedJob, NO_RETRY_FAILS};
use crate::worker::registry::Registry;

/// Stack text kept from a handler panic.
pub const MAX_PANIC_STACK_BYTES: usize = 1024;

/// Jobs failing for longer than this consume attempts even when their stats are unreadable.
const TRACKER_GRACE_SECS: i64 = 2 * 24 * 3600;

thread_local! {
    /// Stack of the last panic raised on this thread, taken by [`catch_panic`].
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a hook that records the stack at the panic site. The previous hook still runs.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Runs one dequeued job through its handler, driving the tracker around it.
///
/// The queued job is mutated in place: `fails` is adjusted to suppress or skip retries
/// and `err` records the failure for the retry and dead sets.
pub struct RedisJobRunner {
    controller: Arc<Controller>,
    registry: Arc<Registry>,
}

impl RedisJobRunner {
    pub fn new(controller: Arc<Controller>, registry: Arc<Registry>) -> Self {
        install_panic_hook();
        Self {
            controller,
            registry,
        }
    }

    pub async fn run(&self, job: &mut QueuedJob, shutdown: CancellationToken) -> Result<()> {
        let spec = self
            .registry
            .get(&job.name)
            .ok_or_else(|| JobServiceError::unknown_job(job.name.as_str()))?;

        let tracking_id = job.tracking_id();
        let tracker = match self.controller.track(&tracking_id).await {
            Ok(t) => t,
            Err(e) => {
                // without stats the job cannot report; retry it without burning attempts
                if job.failed_at == 0 || now_unix() - job.failed_at < TRACKER_GRACE_SECS {
                    job.fails -= 1;
                }
                tracing::error!(
                    job_id = %tracking_id,
                    job_name = %job.name,
                    error = %e,
                    "Failed to track job"
                );
                return Err(e);
            }
        };

        match tracker.job().status {
            Status::Pending | Status::Scheduled => {}
            Status::Stopped => {
                tracing::info!(job_id = %tracking_id, "Job was stopped before it ran");
                return Ok(());
            }
            Status::Error if job.fails > 0 && job.failed_at > 0 => {
                tracker.reset(Status::Pending).await?;
                tracing::info!(job_id = %tracking_id, fails = job.fails, "Retrying failed job");
            }
            other => {
                return Err(JobServiceError::status_mismatch(
                    tracking_id.as_str(),
                    other.as_str(),
                    Status::Running.as_str(),
                ));
            }
        }

        let handler = (spec.factory)();
        let ctx = ExecutionContext::new(Arc::clone(&tracker), shutdown);

        let result = match tracker.run().await {
            Ok(()) => {
                let started = Instant::now();
                let result = execute(handler.as_ref(), &ctx, job).await;
                histogram!("jobservice_job_duration_seconds", "job_name" => spec.name.clone())
                    .record(started.elapsed().as_secs_f64());
                result
            }
            Err(e) if e.is_status_mismatch() => {
                tracing::info!(job_id = %tracking_id, error = %e, "Job superseded before it ran");
                return Ok(());
            }
            Err(e) => Err(e),
        };

        let final_status = finalize(&tracker, &result).await;

        if result.is_err() {
            if let Err(e) = &result {
                job.err = e.to_string();
            }
            if !handler.should_retry() {
                job.fails = NO_RETRY_FAILS;
            }
        }

        if job.is_periodic_execution() {
            if let Err(e) = tracker.periodic_execution_done().await {
                tracing::warn!(
                    job_id = %tracking_id,
                    error = %e,
                    "Failed to mark periodic execution done"
                );
            }
        }

        counter!(
            "jobservice_jobs_completed_total",
            "job_name" => spec.name.clone(),
            "status" => final_status.as_str(),
        )
        .increment(1);

        result
    }
}

/// Run the handler, turning a panic into an error with the handler's truncated stack.
async fn execute(handler: &dyn Handler, ctx: &ExecutionContext, job: &QueuedJob) -> Result<()> {
    let params = job.handler_args();
    let span = ctx.logger().clone();
    let fut = handler.run(ctx, &params).instrument(span);

    match catch_panic(fut).await {
        Ok(result) => result,
        Err((message, stack)) => {
            tracing::error!(job_id = %ctx.job_id(), panic = %message, "Job handler panicked");
            Err(JobServiceError::handler_panicked(message, stack))
        }
    }
}

/// Poll `fut` to completion; a panic comes back as its message and stack.
///
/// The unwind ends on the thread that raised it, so the stack recorded by the panic hook
/// is still in this thread's slot when `catch_unwind` returns.
async fn catch_panic<F, T>(fut: F) -> std::result::Result<T, (String, String)>
where
    F: std::future::Future<Output = T>,
{
    PANIC_STACK.with(|slot| *slot.borrow_mut() = None);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let stack = PANIC_STACK
                .with(|slot| slot.borrow_mut().take())
                .map(|raw| truncate(panic_site(&raw).to_string(), MAX_PANIC_STACK_BYTES))
                .unwrap_or_default();
            Err((message, stack))
        }
    }
}

/// Drop the frames of the hook and the panic machinery above the frame that panicked.
fn panic_site(stack: &str) -> &str {
    const MACHINERY: [&str; 6] = [
        "std::panicking::begin_panic",
        "std::panicking::rust_panic_with_hook",
        "std::rt::begin_panic",
        "__rust_end_short_backtrace",
        "rust_begin_unwind",
        "core::panicking::",
    ];

    let mut start = None;
    let mut seen_machinery = false;
    let mut offset = 0;
    for line in stack.split_inclusive('\n') {
        // `at file:line` continues the frame above it
        if !line.trim_start().starts_with("at ") {
            if MACHINERY.iter().any(|m| line.contains(m)) {
                seen_machinery = true;
                start = None;
            } else if seen_machinery && start.is_none() {
                start = Some(offset);
            }
        }
        offset += line.len();
    }

    match start {
        Some(start) => &stack[start..],
        None => stack,
    }
}

/// Move the job to its final status; a Stopped job stays Stopped.
async fn finalize(tracker: &Tracker, result: &Result<()>) -> Status {
    match tracker.status().await {
        Ok(Status::Stopped) => {
            tracing::info!(job_id = %tracker.job_id(), "Job stopped");
            return Status::Stopped;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(
            job_id = %tracker.job_id(),
            error = %e,
            "Failed to read latest job status"
        ),
    }

    let (target, outcome) = match result {
        Err(e) => {
            tracing::error!(job_id = %tracker.job_id(), error = %e, "Job failed");
            (Status::Error, tracker.fail().await)
        }
        Ok(()) => (Status::Success, tracker.succeed().await),
    };

    if let Err(e) = outcome {
        tracing::warn!(
            job_id = %tracker.job_id(),
            status = %target,
            error = %e,
            "Failed to record final status"
        );
    }
    target
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "é".repeat(600);
        let t = truncate(s, MAX_PANIC_STACK_BYTES);
        assert!(t.len() <= MAX_PANIC_STACK_BYTES);
        assert!(t.chars().all(|c| c == 'é'));
        assert_eq!(truncate("short".into(), 10), "short");
    }

    #[inline(never)]
    fn explode_in_handler() -> u8 {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_panic_stack_points_at_the_panic_site() {
        install_panic_hook();
        let err = catch_panic(async { explode_in_handler() }).await.unwrap_err();
        assert_eq!(err.0, "handler exploded");
        assert!(err.1.len() <= MAX_PANIC_STACK_BYTES);
        assert!(err.1.contains("explode_in_handler"), "stack was: {}", err.1);
        assert!(!err.1.contains("install_panic_hook"));
    }

    #[tokio::test]
    async fn test_catch_panic_passes_values_through() {
        assert_eq!(catch_panic(async { 7 }).await, Ok(7));
    }

    #[test]
    fn test_panic_site_skips_machinery_frames() {
        let stack = concat!(
            "   0: jobservice_core::runner::hook\n",
            "             at src/runner.rs:1:1\n",
            "   1: std::panicking::begin_panic_handler\n",
            "             at /rustc/std/src/panicking.rs:1:1\n",
            "   2: core::panicking::panic_fmt\n",
            "   3: my_crate::handler::run\n",
            "             at src/handler.rs:9:5\n",
        );
        let site = panic_site(stack);
        assert!(site.starts_with("   3: my_crate::handler::run"));
        assert_eq!(panic_site("no frames here"), "no frames here");
    }

    #[test]
    fn test_panic_message_variants() {
        let a: Box<dyn Any + Send> = Box::new("static");
        let b: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let c: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(a.as_ref()), "static");
        assert_eq!(panic_message(b.as_ref()), "owned");
        assert_eq!(panic_message(c.as_ref()), "unknown panic");
    }
}
