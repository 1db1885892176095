//! Logging and metrics for the job service.

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, redact_params, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern,
    SensitiveFieldRedactor,
};
pub use metrics::{init_metrics, MetricsConfig};
