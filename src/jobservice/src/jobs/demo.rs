use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::common::Parameters;
use crate::error::{JobServiceError, Result};
use crate::job::{parse_params, ExecutionContext, Handler, OpCommand};

pub const DEMO_JOB: &str = "DEMO";

const STEPS: u32 = 5;

#[derive(Debug, Default, Deserialize)]
struct DemoParams {
    #[serde(default)]
    image: Option<String>,
    /// Pause between steps in milliseconds
    #[serde(default)]
    step_millis: Option<u64>,
}

/// Walks through a few steps, checking in after each and stopping on request.
#[derive(Debug, Default)]
pub struct DemoJob;

#[async_trait]
impl Handler for DemoJob {
    fn max_fails(&self) -> u32 {
        3
    }

    fn should_retry(&self) -> bool {
        true
    }

    fn validate(&self, params: &Parameters) -> Result<()> {
        let parsed: DemoParams = parse_params(params)?;
        if let Some(image) = &parsed.image {
            if image.trim().is_empty() {
                return Err(JobServiceError::invalid_parameters("image must not be empty"));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: &ExecutionContext, params: &Parameters) -> Result<()> {
        let parsed: DemoParams = parse_params(params)?;
        let image = parsed.image.unwrap_or_else(|| "library/demo".to_string());
        let pause = Duration::from_millis(parsed.step_millis.unwrap_or(1000));

        tracing::info!(image = %image, "Demo job started");
        for step in 1..=STEPS {
            if ctx.op_command().await == OpCommand::Stop {
                tracing::info!(step, "Demo job received stop");
                return Ok(());
            }
            if ctx.is_shutting_down() {
                return Err(JobServiceError::handler_failed("Service is shutting down"));
            }

            tokio::time::sleep(pause).await;
            ctx.check_in(&format!("Step {}/{} of {} done", step, STEPS, image)).await?;
        }
        tracing::info!(image = %image, "Demo job finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate() {
        let job = DemoJob;
        assert!(job.validate(&Parameters::new()).is_ok());

        let mut params = Parameters::new();
        params.insert("image".into(), json!("library/nginx"));
        assert!(job.validate(&params).is_ok());

        params.insert("image".into(), json!(" "));
        assert!(job.validate(&params).is_err());

        params.insert("image".into(), json!(42));
        assert!(job.validate(&params).is_err());
    }
}
