//! Prometheus metrics for the job service.
//!
//! Components record through the `metrics` macros; this module installs the recorder
//! and describes every series once.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Listen address of the scrape endpoint (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every series
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
}

/// Install the Prometheus recorder and its scrape listener.
///
/// A no-op when metrics are disabled. Must be called inside a Tokio runtime so the
/// listener runs on it.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.endpoint.parse()?;
    let mut builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .set_buckets(&config.duration_buckets)?;
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder.install()?;

    register_metric_descriptions();
    tracing::info!(service_name, endpoint = %config.endpoint, "Metrics initialized");
    Ok(())
}

fn register_metric_descriptions() {
    // Jobs
    describe_counter!("jobservice_jobs_enqueued_total", "Jobs enqueued by job name and kind");
    describe_counter!(
        "jobservice_jobs_completed_total",
        "Job runs finished by job name and final status"
    );
    describe_histogram!("jobservice_job_duration_seconds", "Handler run time in seconds");

    // Lifecycle
    describe_gauge!(
        "jobservice_status_retries_pending",
        "Status changes waiting in the in-memory retry list"
    );
    describe_counter!(
        "jobservice_reaper_requeued_total",
        "In-progress jobs of dead pools put back in their queue"
    );

    // Hooks
    describe_counter!("jobservice_hook_events_total", "Hook deliveries by result");

    // Errors
    describe_counter!("jobservice_errors_total", "Errors by code and category");
}
