use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::policy::{Notification, Policy};
use crate::common::rds::{KeySpace, RedisPool};
use crate::error::Result;

const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(5);

/// A policy read from Redis with the raw member it was stored as.
#[derive(Debug, Clone)]
pub struct StoredPolicy {
    pub numeric_id: i64,
    pub policy: Policy,
    pub raw: String,
}

/// Read every policy of `<ns>:period:policies`; undecodable members are skipped.
pub async fn read_policies(keys: &KeySpace, redis: &RedisPool) -> Result<Vec<StoredPolicy>> {
    let mut conn = redis.conn();
    let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
        .arg(keys.periodic_policy())
        .arg(0)
        .arg(-1)
        .arg("WITHSCORES")
        .query_async(&mut conn)
        .await?;

    let mut out = Vec::with_capacity(members.len());
    for (raw, score) in members {
        match Policy::from_json(&raw) {
            Ok(policy) => out.push(StoredPolicy {
                numeric_id: score as i64,
                policy,
                raw,
            }),
            Err(e) => tracing::warn!(error = %e, score, "Skipping undecodable periodic policy"),
        }
    }
    Ok(out)
}

/// In-memory view of the periodic policies, kept fresh through pub/sub.
pub struct PolicyStore {
    keys: KeySpace,
    redis: RedisPool,
    policies: DashMap<String, (i64, Policy)>,
}

impl PolicyStore {
    pub fn new(keys: KeySpace, redis: RedisPool) -> Self {
        Self {
            keys,
            redis,
            policies: DashMap::new(),
        }
    }

    /// Replace the in-memory map with what Redis holds; returns the policy count.
    pub async fn load(&self) -> Result<usize> {
        let stored = read_policies(&self.keys, &self.redis).await?;
        self.policies.clear();
        for s in stored {
            self.policies.insert(s.policy.id.clone(), (s.numeric_id, s.policy));
        }
        tracing::debug!(count = self.policies.len(), "Periodic policies loaded");
        Ok(self.policies.len())
    }

    pub fn get(&self, id: &str) -> Option<(i64, Policy)> {
        self.policies.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of `(numeric id, policy)` pairs.
    pub fn list(&self) -> Vec<(i64, Policy)> {
        self.policies.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Reload on every notification until `shutdown` is cancelled.
    pub fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Periodic policy watcher started");
            loop {
                if let Err(e) = this.watch(&shutdown).await {
                    tracing::warn!(error = %e, "Periodic policy subscription lost");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_INTERVAL) => {}
                }
            }
            tracing::info!("Periodic policy watcher stopped");
        })
    }

    async fn watch(&self, shutdown: &CancellationToken) -> Result<()> {
        let channel = self.keys.periodic_policy_notification();
        let mut pubsub = self.redis.client().get_async_connection().await?.into_pubsub();
        pubsub.subscribe(&channel).await?;

        // catch up with changes made while unsubscribed
        self.load().await?;

        let mut messages = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = messages.next() => msg,
            };
            let Some(msg) = msg else {
                return Ok(());
            };

            let payload: String = msg.get_payload()?;
            match serde_json::from_str::<Notification>(&payload) {
                Ok(n) => tracing::debug!(
                    event = ?n.event,
                    policy_id = %n.id,
                    "Policy notification received"
                ),
                Err(e) => tracing::warn!(
                    error = %e,
                    payload = %payload,
                    "Malformed policy notification"
                ),
            }
            if let Err(e) = self.load().await {
                tracing::error!(error = %e, "Failed to reload periodic policies");
            }
        }
    }
}
