//! Hook agent.
//!
//! Delivers events once synchronously; failed deliveries go to the `<ns>:hook_events`
//! sorted set (score = insertion nanos) and are resent by [`Agent::serve`]. Each
//! delivery is ACKed into the stats hash so a late resend can never overwrite a newer ACK.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::HookClient;
use super::event::Event;
use crate::common::rds::{self, scripts, KeySpace, RedisPool};
use crate::common::utils::{now_unix, now_unix_nanos};
use crate::error::{JobServiceError, Result};
use crate::job::{HookCallback, StatusChange};

/// Sleep of the resend loop when the retry set is empty.
const IDLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Sleep of the resend loop after an error or a failed resend.
const BACKOFF_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one [`Agent::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Posted and ACKed
    Delivered,
    /// Posting failed; the event waits in the retry set
    Queued,
    /// Posting failed and the event is already superseded or expired
    Dropped,
}

pub struct Agent {
    keys: KeySpace,
    redis: RedisPool,
    client: HookClient,
}

impl Agent {
    pub fn new(keys: KeySpace, redis: RedisPool, client: HookClient) -> Self {
        Self { keys, redis, client }
    }

    /// Deliver `event` once; on failure keep it for resending.
    ///
    /// Only an invalid event or a failure to store it for retry is an error.
    pub async fn trigger(&self, event: Event) -> Result<Delivery> {
        event.validate()?;

        match self.client.send_event(&event).await {
            Ok(()) => {
                counter!("jobservice_hook_events_total", "result" => "delivered").increment(1);
                if let Err(e) = self.ack(&event).await {
                    tracing::warn!(
                        job_id = %event.data.job_id,
                        error = %e,
                        "Failed to ACK hook event"
                    );
                }
                Ok(Delivery::Delivered)
            }
            Err(send_err) => {
                tracing::warn!(
                    url = %event.url,
                    job_id = %event.data.job_id,
                    status = %event.data.status,
                    error = %send_err,
                    "Hook event delivery failed"
                );
                let outcome = self.push_for_retry(&event).await?;
                let label = if outcome == Delivery::Queued { "queued" } else { "dropped" };
                counter!("jobservice_hook_events_total", "result" => label).increment(1);
                Ok(outcome)
            }
        }
    }

    async fn push_for_retry(&self, event: &Event) -> Result<Delivery> {
        let now = now_unix();
        if event.is_expired(now) {
            tracing::info!(
                job_id = %event.data.job_id,
                timestamp = event.timestamp,
                "Hook event expired, dropped"
            );
            return Ok(Delivery::Dropped);
        }
        if !self.check_status_match(event).await? {
            tracing::debug!(
                job_id = %event.data.job_id,
                status = %event.data.status,
                "Hook event superseded, not queued"
            );
            return Ok(Delivery::Dropped);
        }

        let raw = serde_json::to_string(event)?;
        let mut conn = self.redis.conn();
        redis::cmd("ZADD")
            .arg(self.keys.hook_event_retry_queue())
            .arg("NX")
            .arg(now_unix_nanos())
            .arg(raw)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(Delivery::Queued)
    }

    /// Whether the event is still at least as new as the persisted status and ACK.
    pub async fn check_status_match(&self, event: &Event) -> Result<bool> {
        let (revision, check_in_at) = event.revision_and_check_in();
        let mut conn = self.redis.conn();
        let reply: String = scripts::check_status_match()
            .key(self.keys.job_stats(&event.data.job_id))
            .arg(event.data.status.as_str())
            .arg(revision)
            .arg(check_in_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply == scripts::REPLY_OK)
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        let (revision, check_in_at) = event.revision_and_check_in();
        let mut conn = self.redis.conn();
        let reply: String = scripts::hook_ack()
            .key(self.keys.job_stats(&event.data.job_id))
            .key(self.keys.job_track_in_progress())
            .arg(event.data.status.as_str())
            .arg(revision)
            .arg(check_in_at)
            .arg(&event.data.job_id)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            scripts::REPLY_OK => Ok(()),
            scripts::REPLY_NOT_FOUND => {
                Err(JobServiceError::not_found("job", event.data.job_id.as_str()))
            }
            _ => Err(JobServiceError::status_mismatch(
                event.data.job_id.as_str(),
                "newer ACK",
                event.data.status.as_str(),
            )),
        }
    }

    /// Pop the oldest queued event and resend it if still valid.
    ///
    /// An empty set is a `NoElements` error. Returns false when the event went back to the
    /// retry set.
    pub async fn resend_once(&self) -> Result<bool> {
        let mut conn = self.redis.conn();
        let (raw, _score) = rds::zpop_min(&mut conn, &self.keys.hook_event_retry_queue()).await?;

        let event: Event = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Dropping undecodable hook event");
                return Ok(true);
            }
        };

        if event.is_expired(now_unix()) {
            tracing::info!(
                job_id = %event.data.job_id,
                timestamp = event.timestamp,
                "Hook event expired, dropped"
            );
            return Ok(true);
        }

        if !self.check_status_match(&event).await? {
            tracing::debug!(
                job_id = %event.data.job_id,
                status = %event.data.status,
                "Hook event outdated, dropped"
            );
            return Ok(true);
        }

        Ok(self.trigger(event).await? != Delivery::Queued)
    }

    /// Run the resend loop until `shutdown` is cancelled.
    pub fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Hook agent resend loop started");
            loop {
                let wait = match this.resend_once().await {
                    Ok(true) => None,
                    Ok(false) => Some(BACKOFF_INTERVAL),
                    Err(e) if e.is_no_elements() => Some(IDLE_INTERVAL),
                    Err(e) => {
                        tracing::warn!(error = %e, "Hook event resend failed");
                        Some(BACKOFF_INTERVAL)
                    }
                };

                match wait {
                    None if shutdown.is_cancelled() => break,
                    None => {}
                    Some(wait) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
            tracing::info!("Hook agent resend loop stopped");
        })
    }
}

#[async_trait]
impl HookCallback for Agent {
    async fn on_status_change(&self, hook_url: &str, change: StatusChange) -> Result<()> {
        let event = Event {
            url: hook_url.to_string(),
            message: format!("Status of job {} changed to {}", change.job_id, change.status),
            data: change,
            timestamp: now_unix(),
        };
        self.trigger(event).await.map(|_| ())
    }
}
