//! What a running handler sees of the service.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use super::status::{OpCommand, Status};
use super::tracker::Tracker;
use crate::error::Result;

/// Execution context passed to [`Handler::run`](super::Handler::run).
///
/// Carries the job's logging span, the process cancellation token, the op-command poll
/// and the check-in channel.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    tracker: Arc<Tracker>,
    shutdown: CancellationToken,
    span: Span,
}

impl ExecutionContext {
    pub fn new(tracker: Arc<Tracker>, shutdown: CancellationToken) -> Self {
        let stats = tracker.job();
        let span = tracing::info_span!(
            "job",
            job_id = %stats.job_id,
            job_name = %stats.job_name,
            job_kind = %stats.job_kind,
        );
        Self {
            tracker,
            shutdown,
            span,
        }
    }

    pub fn job_id(&self) -> &str {
        self.tracker.job_id()
    }

    pub fn job_name(&self) -> String {
        self.tracker.job().job_name
    }

    /// Span every log line of the run should be recorded in.
    pub fn logger(&self) -> &Span {
        &self.span
    }

    /// Cancelled when the service shuts down.
    pub fn system_context(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The latest command for this run: `stop` once the job was moved to Stopped.
    ///
    /// A failed status read yields `none`; the next poll will try again.
    pub async fn op_command(&self) -> OpCommand {
        match self.tracker.status().await {
            Ok(Status::Stopped) => OpCommand::Stop,
            Ok(_) => OpCommand::None,
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "Failed to poll op command");
                OpCommand::None
            }
        }
    }

    /// Report progress; forwarded to the web hook.
    pub async fn check_in(&self, message: impl AsRef<str>) -> Result<()> {
        self.tracker.check_in(message.as_ref()).await
    }
}
