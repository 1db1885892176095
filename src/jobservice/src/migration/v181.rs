//! Upgrade of policy and stats records written before 1.8.0.
//!
//! Older releases stored `status_hook` instead of `web_hook_url`, flagged policies with
//! `multiple_executions`, did not link policy stats to their numeric ID and could leave
//! several entries for one policy in the policy set.

use async_trait::async_trait;
use std::collections::HashMap;

use super::migrator::{Metadata, Migrator};
use crate::common::rds::{self, KeySpace, RedisPool};
use crate::common::utils::now_unix;
use crate::error::Result;
use crate::job::stats::fields;
use crate::job::{ref_link, Kind, Stats, Status};
use crate::period::Policy;

pub struct PolicyMigratorV181 {
    keys: KeySpace,
    redis: RedisPool,
}

/// Policy entry kept after de-duplication.
struct Kept {
    numeric_id: i64,
    policy: Policy,
}

impl PolicyMigratorV181 {
    pub fn new(keys: KeySpace, redis: RedisPool) -> Self {
        Self { keys, redis }
    }

    /// Remove every policy entry but the newest per policy ID and per well-known
    /// duplicate; returns the survivors.
    async fn dedup_policies(&self) -> Result<Vec<Kept>> {
        let key = self.keys.periodic_policy();
        let mut conn = self.redis.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let mut obsolete = Vec::new();
        let mut newest: HashMap<String, (i64, Policy, String)> = HashMap::new();
        for (raw, score) in members {
            let policy = match Policy::from_json(&raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, score, "Removing undecodable policy entry");
                    obsolete.push(raw);
                    continue;
                }
            };
            let numeric_id = score as i64;
            match newest.get(&policy.id) {
                Some((kept_id, _, _)) if *kept_id >= numeric_id => obsolete.push(raw),
                _ => {
                    let replaced = newest.insert(policy.id.clone(), (numeric_id, policy, raw));
                    if let Some((_, _, old_raw)) = replaced {
                        obsolete.push(old_raw);
                    }
                }
            }
        }

        let mut kept: Vec<(i64, Policy, String)> = newest.into_values().collect();
        kept.sort_by(|a, b| b.0.cmp(&a.0));
        let mut survivors: Vec<(i64, Policy, String)> = Vec::with_capacity(kept.len());
        for entry in kept {
            if survivors.iter().any(|s| s.1.duplicates(&entry.1)) {
                tracing::info!(
                    policy_id = %entry.1.id,
                    job_name = %entry.1.job_name,
                    "Removing duplicated policy"
                );
                obsolete.push(entry.2);
            } else {
                survivors.push(entry);
            }
        }

        if !obsolete.is_empty() {
            redis::cmd("ZREM")
                .arg(&key)
                .arg(&obsolete)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }

        Ok(survivors
            .into_iter()
            .map(|(numeric_id, policy, _)| Kept { numeric_id, policy })
            .collect())
    }

    async fn upgrade_policy_stats(&self, kept: &Kept) -> Result<()> {
        let key = self.keys.job_stats(&kept.policy.id);
        let mut conn = self.redis.conn();
        let values = rds::hget_all(&mut conn, &key).await?;

        if values.is_empty() {
            let now = now_unix();
            let mut stats = Stats::new(&kept.policy.id, &kept.policy.job_name);
            stats.job_kind = Kind::Periodic;
            stats.status = Status::Scheduled;
            stats.enqueue_time = now;
            stats.run_at = now;
            stats.cron_spec = kept.policy.cron_spec.clone();
            stats.numeric_pid = kept.numeric_id;
            stats.web_hook_url = kept.policy.web_hook_url.clone();
            stats.ref_link = ref_link(&kept.policy.id);
            stats.parameters = kept.policy.job_params.clone();
            rds::hm_set(&mut conn, &key, &stats.to_fields()?).await?;
            tracing::info!(policy_id = %kept.policy.id, "Created missing policy stats");
            return Ok(());
        }

        let mut updates = vec![
            (fields::STATUS, Status::Scheduled.to_string()),
            (fields::KIND, Kind::Periodic.to_string()),
            (fields::NUMERIC_POLICY_ID, kept.numeric_id.to_string()),
        ];
        if values.get(fields::CRON_SPEC).map_or(true, |v| v.is_empty()) {
            updates.push((fields::CRON_SPEC, kept.policy.cron_spec.clone()));
        }
        if let Some(hook) = moved_hook(&values) {
            updates.push((fields::WEB_HOOK_URL, hook));
        }
        rds::hm_set(&mut conn, &key, &updates).await?;

        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(&key)
            .arg(fields::LEGACY_STATUS_HOOK)
            .arg(fields::LEGACY_MULTIPLE_EXECUTIONS)
            .ignore()
            .cmd("PERSIST")
            .arg(&key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Strip legacy fields from every other stats record.
    async fn clean_legacy_fields(&self) -> Result<usize> {
        let mut conn = self.redis.conn();
        let keys = rds::scan_keys(&mut conn, &self.keys.job_stats_pattern()).await?;

        let mut cleaned = 0;
        for key in keys {
            let legacy = rds::hm_get(
                &mut conn,
                &key,
                &[
                    fields::LEGACY_STATUS_HOOK,
                    fields::LEGACY_MULTIPLE_EXECUTIONS,
                    fields::WEB_HOOK_URL,
                ],
            )
            .await?;
            let (status_hook, multiple, web_hook) = match legacy.as_slice() {
                [a, b, c] => (a.clone(), b.clone(), c.clone()),
                _ => continue,
            };
            if status_hook.is_none() && multiple.is_none() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            if let Some(hook) = status_hook.filter(|h| !h.is_empty()) {
                if web_hook.map_or(true, |w| w.is_empty()) {
                    pipe.cmd("HSET").arg(&key).arg(fields::WEB_HOOK_URL).arg(hook).ignore();
                }
            }
            pipe.cmd("HDEL")
                .arg(&key)
                .arg(fields::LEGACY_STATUS_HOOK)
                .arg(fields::LEGACY_MULTIPLE_EXECUTIONS)
                .ignore();
            pipe.query_async::<_, ()>(&mut conn).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

/// The legacy hook URL when no current one is set.
fn moved_hook(values: &HashMap<String, String>) -> Option<String> {
    let current = values.get(fields::WEB_HOOK_URL).map(String::as_str).unwrap_or("");
    match values.get(fields::LEGACY_STATUS_HOOK) {
        Some(hook) if !hook.is_empty() && current.is_empty() => Some(hook.clone()),
        _ => None,
    }
}

#[async_trait]
impl Migrator for PolicyMigratorV181 {
    fn metadata(&self) -> Metadata {
        Metadata {
            from: "<1.8.0".to_string(),
            to: "1.8.1".to_string(),
            object_ref: "periodic policies and job stats".to_string(),
        }
    }

    async fn migrate(&self) -> Result<()> {
        let kept = self.dedup_policies().await?;
        for entry in &kept {
            self.upgrade_policy_stats(entry).await?;
        }
        let cleaned = self.clean_legacy_fields().await?;
        tracing::info!(policies = kept.len(), cleaned, "Policy data migrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moved_hook_only_when_missing() {
        let mut values = HashMap::new();
        values.insert(fields::LEGACY_STATUS_HOOK.to_string(), "http://hook/a".to_string());
        assert_eq!(moved_hook(&values).as_deref(), Some("http://hook/a"));

        values.insert(fields::WEB_HOOK_URL.to_string(), "http://hook/b".to_string());
        assert_eq!(moved_hook(&values), None);
    }
}
