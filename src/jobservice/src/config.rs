//! Configuration management.
//!
//! Sources are layered: an optional file, then `JOBSERVICE__*` environment variables
//! (`JOBSERVICE__REDIS__URL`, `JOBSERVICE__WORKER_POOL__WORKERS`, ...).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{JobServiceError, Result};
use crate::telemetry::{LoggingConfig, MetricsConfig};

const ENV_PREFIX: &str = "JOBSERVICE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    /// Retry loop of failed status writes
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Webhook delivery
    #[serde(default)]
    pub hook: HookConfig,

    /// Periodic enqueuer
    #[serde(default)]
    pub period: PeriodConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix of every key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_redis_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            namespace: default_namespace(),
            connect_timeout: default_redis_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    /// Concurrent workers of this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fixed pool ID; random when unset
    #[serde(default)]
    pub pool_id: Option<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pool_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_long_loop_interval", with = "humantime_serde")]
    pub long_loop_interval: Duration,

    /// Upper bound of the jitter added to each wait
    #[serde(default = "default_short_loop_interval", with = "humantime_serde")]
    pub short_loop_interval: Duration,

    #[serde(default = "default_retry_list_capacity")]
    pub retry_list_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            long_loop_interval: default_long_loop_interval(),
            short_loop_interval: default_short_loop_interval(),
            retry_list_capacity: default_retry_list_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default = "default_hook_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Whole request, response included
    #[serde(default = "default_hook_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_hook_connect_timeout(),
            request_timeout: default_hook_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodConfig {
    #[serde(default = "default_enqueue_interval", with = "humantime_serde")]
    pub enqueue_interval: Duration,

    /// How far ahead firings are scheduled
    #[serde(default = "default_horizon", with = "humantime_serde")]
    pub horizon: Duration,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            enqueue_interval: default_enqueue_interval(),
            horizon: default_horizon(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_namespace() -> String { "{jobservice_namespace}".to_string() }
fn default_redis_connect_timeout() -> Duration { Duration::from_secs(10) }
fn default_workers() -> usize { 10 }
fn default_long_loop_interval() -> Duration { Duration::from_secs(60) }
fn default_short_loop_interval() -> Duration { Duration::from_secs(5) }
fn default_retry_list_capacity() -> usize { 10_000 }
fn default_hook_connect_timeout() -> Duration { Duration::from_secs(30) }
fn default_hook_request_timeout() -> Duration { Duration::from_secs(15) }
fn default_pool_max_idle_per_host() -> usize { 10 }
fn default_enqueue_interval() -> Duration { Duration::from_secs(120) }
fn default_horizon() -> Duration { Duration::from_secs(240) }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, overridden by the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.namespace.trim().is_empty() {
            return Err(JobServiceError::configuration("Redis namespace must not be empty"));
        }
        if self.worker_pool.workers == 0 {
            return Err(JobServiceError::configuration("Worker count must be positive"));
        }
        if let Err(e) = redis::Client::open(self.redis.url.as_str()) {
            return Err(JobServiceError::configuration(format!(
                "Invalid Redis URL {}: {}",
                self.redis.url, e
            )));
        }
        if self.period.horizon < self.period.enqueue_interval {
            return Err(JobServiceError::configuration(
                "Periodic horizon must cover at least one enqueue interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_pool.workers, 10);
        assert_eq!(cfg.hook.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.period.horizon, Duration::from_secs(240));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_from_file_with_humantime_durations() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[redis]
url = "redis://127.0.0.1:6380/2"
namespace = "test_ns"

[worker_pool]
workers = 4
pool_id = "pool-a"

[lifecycle]
long_loop_interval = "30s"

[period]
enqueue_interval = "1m"
horizon = "3m"
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.redis.namespace, "test_ns");
        assert_eq!(cfg.worker_pool.workers, 4);
        assert_eq!(cfg.worker_pool.pool_id.as_deref(), Some("pool-a"));
        assert_eq!(cfg.lifecycle.long_loop_interval, Duration::from_secs(30));
        assert_eq!(cfg.lifecycle.short_loop_interval, Duration::from_secs(5));
        assert_eq!(cfg.period.enqueue_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.worker_pool.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.redis.namespace = " ".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.redis.url = "not a url".into();
        assert!(cfg.validate().is_err());
    }
}
