//! Wire format of queued jobs.

use redis::aio::ConnectionLike;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::rds::{scripts, KeySpace};
use crate::common::utils::{canonical_json, make_identifier, now_unix};
use crate::common::Parameters;
use crate::error::Result;
use crate::job::{periodic_execution_id, PERIODIC_EXECUTION_MARK};

/// Fails count that suppresses any further retry.
pub const NO_RETRY_FAILS: i64 = 10_000_000_000;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A job as stored in `jobs:<type>`, the in-progress lists and the scheduled, retry and
/// dead sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub name: String,
    pub id: String,
    #[serde(rename = "t")]
    pub enqueued_at: i64,
    #[serde(default)]
    pub args: Parameters,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fails: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_at: i64,
}

impl QueuedJob {
    /// A new job with a fresh ID, enqueued now.
    pub fn new(name: impl Into<String>, args: Parameters) -> Self {
        Self {
            name: name.into(),
            id: make_identifier(),
            enqueued_at: now_unix(),
            args,
            unique: false,
            unique_key: None,
            fails: 0,
            err: String::new(),
            failed_at: 0,
        }
    }

    /// One firing of periodic policy `policy_id` at `epoch`.
    pub fn periodic_execution(
        policy_id: impl Into<String>,
        name: impl Into<String>,
        mut args: Parameters,
        epoch: i64,
    ) -> Self {
        args.insert(PERIODIC_EXECUTION_MARK.to_string(), Value::Bool(true));
        Self {
            id: policy_id.into(),
            enqueued_at: epoch,
            ..Self::new(name, args)
        }
    }

    /// Mark as unique; returns the dedup key to hold while queued or running.
    pub fn make_unique(&mut self, keys: &KeySpace) -> String {
        let key = keys.unique_job(&self.name, &canonical_json(&self.args));
        self.unique = true;
        self.unique_key = Some(key.clone());
        key
    }

    pub fn is_periodic_execution(&self) -> bool {
        matches!(self.args.get(PERIODIC_EXECUTION_MARK), Some(Value::Bool(true)))
    }

    /// ID of the stats record this job reports to.
    pub fn tracking_id(&self) -> String {
        if self.is_periodic_execution() {
            periodic_execution_id(&self.id, self.enqueued_at)
        } else {
            self.id.clone()
        }
    }

    /// Arguments handed to the handler, without internal marks.
    pub fn handler_args(&self) -> Parameters {
        let mut args = self.args.clone();
        args.remove(PERIODIC_EXECUTION_MARK);
        args
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Handle returned by the enqueue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedJob {
    pub job_id: String,
    pub name: String,
    pub enqueued_at: i64,
    pub run_at: Option<i64>,
}

impl From<&QueuedJob> for EnqueuedJob {
    fn from(job: &QueuedJob) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            enqueued_at: job.enqueued_at,
            run_at: None,
        }
    }
}

/// Remove the job `job_id` scheduled at `run_at`, releasing its unique key.
///
/// Returns false when no such entry is scheduled (already running or gone).
pub async fn remove_scheduled<C>(
    conn: &mut C,
    keys: &KeySpace,
    run_at: i64,
    job_id: &str,
) -> Result<bool>
where
    C: ConnectionLike + Send,
{
    let raw: Option<String> = scripts::delete_zset_job()
        .key(keys.scheduled())
        .arg(run_at)
        .arg(job_id)
        .invoke_async(conn)
        .await?;

    let Some(raw) = raw else {
        return Ok(false);
    };

    match QueuedJob::from_json(&raw) {
        Ok(job) if job.unique => {
            let key = job
                .unique_key
                .clone()
                .unwrap_or_else(|| keys.unique_job(&job.name, &canonical_json(&job.args)));
            redis::cmd("DEL").arg(key).query_async::<_, i64>(conn).await?;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(job_id, error = %e, "Removed an undecodable scheduled entry"),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_uses_short_field_names() {
        let mut args = Parameters::new();
        args.insert("x".into(), json!(1));
        let mut job = QueuedJob::new("sample", args);
        job.id = "abc".into();
        job.enqueued_at = 100;

        let raw = job.to_json().unwrap();
        assert_eq!(raw, r#"{"name":"sample","id":"abc","t":100,"args":{"x":1}}"#);
        assert_eq!(QueuedJob::from_json(&raw).unwrap(), job);
    }

    #[test]
    fn test_periodic_execution_ids() {
        let job =
            QueuedJob::periodic_execution("policy1", "IMAGE_GC", Parameters::new(), 1_700_000_000);
        assert!(job.is_periodic_execution());
        assert_eq!(job.id, "policy1");
        assert_eq!(job.tracking_id(), "policy1@1700000000");
        assert!(job.handler_args().is_empty());

        let plain = QueuedJob::new("sample", Parameters::new());
        assert_eq!(plain.tracking_id(), plain.id);
    }

    #[test]
    fn test_periodic_execution_member_is_deterministic() {
        let mut args = Parameters::new();
        args.insert("b".into(), json!(2));
        args.insert("a".into(), json!(1));
        let one = QueuedJob::periodic_execution("p", "IMAGE_GC", args.clone(), 60)
            .to_json()
            .unwrap();
        let two = QueuedJob::periodic_execution("p", "IMAGE_GC", args, 60).to_json().unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_make_unique_uses_canonical_params() {
        let keys = KeySpace::new("ns");
        let mut args = Parameters::new();
        args.insert("b".into(), json!(2));
        args.insert("a".into(), json!(1));
        let mut job = QueuedJob::new("sample", args);
        let key = job.make_unique(&keys);
        assert!(job.unique);
        assert_eq!(key, keys.unique_job("sample", r#"{"a":1,"b":2}"#));
    }
}
