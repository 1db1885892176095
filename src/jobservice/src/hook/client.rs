use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::event::Event;
use crate::config::HookConfig;
use crate::error::{ErrorCode, JobServiceError, Result};

/// HTTP client posting status changes to web hooks.
///
/// Proxies configured through `HTTP_PROXY`/`HTTPS_PROXY` are honoured.
#[derive(Debug, Clone)]
pub struct HookClient {
    client: Client,
}

impl HookClient {
    pub fn new(config: &HookConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| {
                JobServiceError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to create hook HTTP client",
                    e.to_string(),
                )
            })?;
        Ok(Self { client })
    }

    /// POST the event's status change; anything other than 2xx is an error.
    pub async fn send_event(&self, event: &Event) -> Result<()> {
        event.validate()?;

        let resp = self
            .client
            .post(&event.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&event.data)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.ok().filter(|b| !b.is_empty());
            return Err(JobServiceError::hook_rejected(
                event.url.as_str(),
                status.as_u16(),
                body,
            ));
        }

        tracing::debug!(url = %event.url, job_id = %event.data.job_id, "Hook event delivered");
        Ok(())
    }
}
