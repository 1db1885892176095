//! The contract every job handler implements.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::context::ExecutionContext;
use crate::common::Parameters;
use crate::error::{JobServiceError, Result};

/// Priority used when a handler does not pick one.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Upper bound of [`Handler::priority`].
pub const MAX_PRIORITY: u32 = 100_000;

/// A unit of background work.
///
/// A fresh instance is built from the registered factory for every run, so implementors
/// may keep per-run state in `self`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Attempts allowed before the job is moved to the dead set.
    fn max_fails(&self) -> u32;

    /// Jobs of this type allowed to run at once across all pools; 0 means unlimited.
    fn max_concurrency(&self) -> u32 {
        0
    }

    /// Relative fetch weight of this job type.
    fn priority(&self) -> u32 {
        DEFAULT_PRIORITY
    }

    /// Whether a failed run is retried at all.
    fn should_retry(&self) -> bool;

    /// Reject parameters before the job is enqueued.
    fn validate(&self, params: &Parameters) -> Result<()>;

    async fn run(&self, ctx: &ExecutionContext, params: &Parameters) -> Result<()>;
}

/// Builds a fresh handler per run.
pub type HandlerFactory = std::sync::Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Decode the parameter map into a handler's typed parameters.
pub fn parse_params<T: DeserializeOwned>(params: &Parameters) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| JobServiceError::invalid_parameters(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct ScanParams {
        repository: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    #[test]
    fn test_parse_params_typed() {
        let mut params = Parameters::new();
        params.insert("repository".into(), json!("library/nginx"));
        params.insert("tags".into(), json!(["1.25", "latest"]));
        let parsed: ScanParams = parse_params(&params).unwrap();
        assert_eq!(parsed.repository, "library/nginx");
        assert_eq!(parsed.tags.len(), 2);
    }

    #[test]
    fn test_parse_params_rejects_missing_field() {
        let err = parse_params::<ScanParams>(&Parameters::new()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidParameters);
    }
}
