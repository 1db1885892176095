use semver::Version;
use std::time::Duration;

use super::migrator::Migrator;
use crate::common::rds::{self, scripts, KeySpace, RedisPool};
use crate::common::utils::make_identifier;
use crate::error::{JobServiceError, Result};

/// Schema version of the state this build reads and writes.
pub const TARGET_SCHEMA_VERSION: &str = "1.8.1";

/// Lifetime of `<ns>:_schema_version:lock` when its holder dies mid-chain.
const LOCK_TTL_MS: u64 = 600_000;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const LOCK_ATTEMPTS: u32 = 120;

/// Parse a stored version leniently: a leading `v` and missing minor or patch parts are
/// accepted (`v1.8` reads as `1.8.0`).
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let parts = trimmed.split('.').count();
    let padded = match parts {
        1 => format!("{}.0.0", trimmed),
        2 => format!("{}.0", trimmed),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).map_err(|e| {
        JobServiceError::migration_failed(format!("Invalid schema version {:?}: {}", raw, e))
    })
}

/// What [`MigrationManager::migrate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The stored version already is the target
    UpToDate,
    /// Nothing stored and nothing registered
    NoMigrators,
    /// The chain ran and the target version was written
    Migrated { from: Option<String>, applied: usize },
}

/// Append-only chain of migrators guarded by `<ns>:_schema_version`.
pub struct MigrationManager {
    keys: KeySpace,
    redis: RedisPool,
    migrators: Vec<Box<dyn Migrator>>,
}

impl MigrationManager {
    pub fn new(keys: KeySpace, redis: RedisPool) -> Self {
        Self {
            keys,
            redis,
            migrators: Vec::new(),
        }
    }

    pub fn register(&mut self, migrator: Box<dyn Migrator>) {
        let meta = migrator.metadata();
        tracing::debug!(
            from = %meta.from,
            to = %meta.to,
            object = %meta.object_ref,
            "Migrator registered"
        );
        self.migrators.push(migrator);
    }

    pub async fn stored_version(&self) -> Result<Option<String>> {
        Ok(self.raw_version().await?.filter(|v| !v.trim().is_empty()))
    }

    async fn raw_version(&self) -> Result<Option<String>> {
        let mut conn = self.redis.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.schema_version())
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    /// Bring the stored state to [`TARGET_SCHEMA_VERSION`].
    ///
    /// Refuses to run against state written by a newer build. Migrators whose target is
    /// not above the stored version are skipped; the first failure stops the chain and
    /// leaves the stored version untouched.
    ///
    /// The chain runs under `<ns>:_schema_version:lock`, and the version is written with a
    /// compare-and-swap against the value read at the start. A process that waited on the
    /// lock re-reads the version and finds it up to date.
    pub async fn migrate(&self) -> Result<Outcome> {
        let key = self.keys.schema_migration_lock();
        let token = make_identifier();
        self.acquire(&key, &token).await?;

        let result = self.migrate_locked().await;
        let mut conn = self.redis.conn();
        if !rds::release_lock(&mut conn, &key, &token).await? {
            tracing::warn!(key = %key, "Migration lock expired before release");
        }
        result
    }

    async fn acquire(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        for attempt in 0..LOCK_ATTEMPTS {
            if rds::acquire_lock(&mut conn, key, token, LOCK_TTL_MS).await? {
                return Ok(());
            }
            if attempt == 0 {
                tracing::info!(key = %key, "Another process is migrating, waiting");
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
        Err(JobServiceError::lock_unavailable(key))
    }

    async fn migrate_locked(&self) -> Result<Outcome> {
        let target = parse_version(TARGET_SCHEMA_VERSION)?;
        let raw = self.raw_version().await?;
        let stored = raw.clone().filter(|v| !v.trim().is_empty());

        let current = match &stored {
            Some(raw) => {
                let current = parse_version(raw)?;
                if current == target {
                    tracing::info!(version = %raw, "Schema is up to date");
                    return Ok(Outcome::UpToDate);
                }
                if current > target {
                    return Err(JobServiceError::downgrade_refused(
                        raw.as_str(),
                        TARGET_SCHEMA_VERSION,
                    ));
                }
                Some(current)
            }
            None => None,
        };

        if self.migrators.is_empty() && stored.is_none() {
            tracing::warn!("No schema version stored and no migrator registered");
            return Ok(Outcome::NoMigrators);
        }

        let mut applied = 0;
        for migrator in &self.migrators {
            let meta = migrator.metadata();
            if let Some(current) = &current {
                if parse_version(&meta.to)? <= *current {
                    tracing::debug!(to = %meta.to, "Migrator already applied, skipped");
                    continue;
                }
            }

            tracing::info!(
                from = %meta.from,
                to = %meta.to,
                object = %meta.object_ref,
                "Running migrator"
            );
            migrator.migrate().await.map_err(|e| {
                JobServiceError::migration_failed(format!(
                    "Migration {} -> {} of {} failed: {}",
                    meta.from, meta.to, meta.object_ref, e
                ))
            })?;
            applied += 1;
        }

        let mut conn = self.redis.conn();
        let swapped: i64 = scripts::swap_version()
            .key(self.keys.schema_version())
            .arg(raw.as_deref().unwrap_or(""))
            .arg(TARGET_SCHEMA_VERSION)
            .invoke_async(&mut conn)
            .await?;
        if swapped == 0 {
            return Err(JobServiceError::migration_failed(format!(
                "Schema version changed from {:?} while migrating",
                stored
            )));
        }

        tracing::info!(from = ?stored, to = TARGET_SCHEMA_VERSION, applied, "Schema migrated");
        Ok(Outcome::Migrated { from: stored, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("1.8.1").unwrap(), Version::new(1, 8, 1));
        assert_eq!(parse_version("v1.8").unwrap(), Version::new(1, 8, 0));
        assert_eq!(parse_version(" 2 ").unwrap(), Version::new(2, 0, 0));
        assert!(parse_version("latest").is_err());
    }

    #[test]
    fn test_version_order() {
        let target = parse_version(TARGET_SCHEMA_VERSION).unwrap();
        assert!(parse_version("1.7.9").unwrap() < target);
        assert!(parse_version("1.10.0").unwrap() > target);
    }
}
