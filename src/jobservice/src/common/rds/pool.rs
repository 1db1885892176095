//! Shared Redis connection handle.

use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::error::{ErrorCode, JobServiceError, Result};

/// Process-wide Redis handle.
///
/// Commands go through a multiplexed [`ConnectionManager`] that reconnects on its own;
/// cloning the pool or calling [`RedisPool::conn`] is cheap. Subscribers need a dedicated
/// connection and get it from [`RedisPool::client`].
#[derive(Clone)]
pub struct RedisPool {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisPool {
    /// Open a client for `url` and establish the managed connection.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            JobServiceError::with_internal(
                ErrorCode::ConfigurationError,
                "Invalid Redis URL",
                e.to_string(),
            )
        })?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: redis::Client) -> Result<Self> {
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    /// A connection for one operation.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Ping until Redis answers, up to `attempts` times.
    pub async fn wait_ready(&self, attempts: u32, interval: Duration) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Redis is not ready yet");
                    last_err = Some(e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| JobServiceError::internal("Redis readiness check failed")))
    }
}
