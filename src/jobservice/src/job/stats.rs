//! The persisted per-job stats record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::status::{Kind, Status};
use crate::common::utils::is_valid_url;
use crate::common::Parameters;
use crate::error::{JobServiceError, Result};

/// Hash fields written by [`Stats::to_fields`] and understood by [`Stats::from_fields`].
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const UNIQUE: &str = "unique";
    pub const STATUS: &str = "status";
    pub const REVISION: &str = "revision";
    pub const ENQUEUE_TIME: &str = "enqueue_time";
    pub const UPDATE_TIME: &str = "update_time";
    pub const RUN_AT: &str = "run_at";
    pub const CRON_SPEC: &str = "cron_spec";
    pub const NUMERIC_POLICY_ID: &str = "numeric_policy_id";
    pub const WEB_HOOK_URL: &str = "web_hook_url";
    pub const REF_LINK: &str = "ref_link";
    pub const UPSTREAM_JOB_ID: &str = "upstream_job_id";
    pub const CHECK_IN: &str = "check_in";
    pub const CHECK_IN_AT: &str = "check_in_at";
    pub const DIE_AT: &str = "die_at";
    pub const ACK: &str = "ack";
    pub const PARAMETERS: &str = "parameters";

    /// Legacy fields removed by the 1.8.1 migration.
    pub const LEGACY_STATUS_HOOK: &str = "status_hook";
    pub const LEGACY_MULTIPLE_EXECUTIONS: &str = "multiple_executions";
}

/// The last status change successfully delivered to the web hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHook {
    pub status: Status,
    pub revision: i64,
    pub check_in_at: i64,
}

/// Stats of one job, mirrored from `<ns>:job_stats:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(rename = "id")]
    pub job_id: String,
    #[serde(rename = "name")]
    pub job_name: String,
    #[serde(rename = "kind")]
    pub job_kind: Kind,
    #[serde(rename = "unique", default)]
    pub is_unique: bool,
    pub status: Status,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub enqueue_time: i64,
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub run_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_spec: String,
    #[serde(rename = "numeric_policy_id", default)]
    pub numeric_pid: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ref_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_in: String,
    #[serde(default)]
    pub check_in_at: i64,
    #[serde(default)]
    pub die_at: i64,
    #[serde(rename = "ack", default, skip_serializing_if = "Option::is_none")]
    pub hook_ack: Option<AckHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl Stats {
    /// A blank record for `job_id` of `job_name`, Pending and Generic.
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            job_kind: Kind::Generic,
            is_unique: false,
            status: Status::Pending,
            revision: 0,
            enqueue_time: 0,
            update_time: 0,
            run_at: 0,
            cron_spec: String::new(),
            numeric_pid: 0,
            web_hook_url: String::new(),
            ref_link: String::new(),
            upstream_job_id: String::new(),
            check_in: String::new(),
            check_in_at: 0,
            die_at: 0,
            hook_ack: None,
            parameters: None,
        }
    }

    pub fn has_web_hook(&self) -> bool {
        !self.web_hook_url.is_empty()
    }

    /// Executions spawned by a periodic policy carry their policy ID as upstream.
    pub fn is_periodic_execution(&self) -> bool {
        !self.upstream_job_id.is_empty()
    }

    /// Check the record is complete enough to be saved.
    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(JobServiceError::bad_request("Missing job ID in job stats"));
        }
        if self.job_name.is_empty() {
            return Err(JobServiceError::bad_request("Missing job name in job stats"));
        }

        match self.job_kind {
            Kind::Generic => {
                if self.enqueue_time <= 0 {
                    return Err(JobServiceError::bad_request("Missing enqueue time in job stats"));
                }
            }
            Kind::Scheduled => {
                if self.run_at <= 0 {
                    return Err(JobServiceError::bad_request(
                        "Missing run time in scheduled job stats",
                    ));
                }
            }
            Kind::Periodic => {
                if self.cron_spec.is_empty() {
                    return Err(JobServiceError::bad_request(
                        "Missing cron spec in periodic job stats",
                    ));
                }
            }
        }

        if self.has_web_hook() && !is_valid_url(&self.web_hook_url) {
            return Err(JobServiceError::bad_request(format!(
                "Invalid web hook URL: {}",
                self.web_hook_url
            )));
        }

        Ok(())
    }

    /// Field/value pairs as written by `Save`.
    ///
    /// `update_time` is left to the write helper; `ack` is never written here.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>> {
        let mut out = vec![
            (fields::ID, self.job_id.clone()),
            (fields::NAME, self.job_name.clone()),
            (fields::KIND, self.job_kind.to_string()),
            (fields::UNIQUE, self.is_unique.to_string()),
            (fields::STATUS, self.status.to_string()),
            (fields::REVISION, self.revision.to_string()),
            (fields::ENQUEUE_TIME, self.enqueue_time.to_string()),
            (fields::RUN_AT, self.run_at.to_string()),
            (fields::CRON_SPEC, self.cron_spec.clone()),
            (fields::NUMERIC_POLICY_ID, self.numeric_pid.to_string()),
            (fields::WEB_HOOK_URL, self.web_hook_url.clone()),
            (fields::REF_LINK, self.ref_link.clone()),
        ];

        if !self.upstream_job_id.is_empty() {
            out.push((fields::UPSTREAM_JOB_ID, self.upstream_job_id.clone()));
        }
        if self.check_in_at > 0 && !self.check_in.is_empty() {
            out.push((fields::CHECK_IN, self.check_in.clone()));
            out.push((fields::CHECK_IN_AT, self.check_in_at.to_string()));
        }
        if self.die_at > 0 {
            out.push((fields::DIE_AT, self.die_at.to_string()));
        }
        if let Some(params) = self.parameters.as_ref().filter(|p| !p.is_empty()) {
            out.push((fields::PARAMETERS, serde_json::to_string(params)?));
        }

        Ok(out)
    }

    /// Rebuild a record from `HGETALL` output. An empty map is NotFound.
    ///
    /// Unknown fields are ignored and malformed numbers read as zero, so records written by
    /// older releases still load.
    pub fn from_fields(job_id: &str, values: &HashMap<String, String>) -> Result<Self> {
        if values.is_empty() {
            return Err(JobServiceError::not_found("job", job_id));
        }

        let int = |name: &str| -> i64 {
            values
                .get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let text = |name: &str| -> String { values.get(name).cloned().unwrap_or_default() };

        let status = values
            .get(fields::STATUS)
            .ok_or_else(|| {
                JobServiceError::internal(format!("Job {} stats carry no status", job_id))
            })?
            .parse::<Status>()?;

        let job_kind = match values.get(fields::KIND) {
            Some(k) if !k.is_empty() => k.parse::<Kind>()?,
            _ => Kind::Generic,
        };

        let is_unique = values
            .get(fields::UNIQUE)
            .map(|v| matches!(v.as_str(), "true" | "1"))
            .unwrap_or(false);

        let hook_ack = match values.get(fields::ACK) {
            Some(raw) if !raw.is_empty() => match serde_json::from_str::<AckHook>(raw) {
                Ok(ack) => Some(ack),
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Ignoring malformed hook ACK");
                    None
                }
            },
            _ => None,
        };

        let parameters = match values.get(fields::PARAMETERS) {
            Some(raw) if !raw.is_empty() => serde_json::from_str::<Parameters>(raw).ok(),
            _ => None,
        };

        let id = text(fields::ID);

        Ok(Self {
            job_id: if id.is_empty() { job_id.to_string() } else { id },
            job_name: text(fields::NAME),
            job_kind,
            is_unique,
            status,
            revision: int(fields::REVISION),
            enqueue_time: int(fields::ENQUEUE_TIME),
            update_time: int(fields::UPDATE_TIME),
            run_at: int(fields::RUN_AT),
            cron_spec: text(fields::CRON_SPEC),
            numeric_pid: int(fields::NUMERIC_POLICY_ID),
            web_hook_url: text(fields::WEB_HOOK_URL),
            ref_link: text(fields::REF_LINK),
            upstream_job_id: text(fields::UPSTREAM_JOB_ID),
            check_in: text(fields::CHECK_IN),
            check_in_at: int(fields::CHECK_IN_AT),
            die_at: int(fields::DIE_AT),
            hook_ack,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn generic() -> Stats {
        let mut s = Stats::new("abc", "sample");
        s.enqueue_time = 1_700_000_000;
        s
    }

    #[test]
    fn test_validate_requires_identity() {
        assert!(Stats::new("", "sample").validate().is_err());
        assert!(Stats::new("abc", "").validate().is_err());
        assert!(generic().validate().is_ok());
    }

    #[test]
    fn test_validate_per_kind() {
        let mut s = generic();
        s.job_kind = Kind::Scheduled;
        assert!(s.validate().is_err());
        s.run_at = 1_700_000_100;
        assert!(s.validate().is_ok());

        s.job_kind = Kind::Periodic;
        assert!(s.validate().is_err());
        s.cron_spec = "0 0 0 * * *".into();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_hook_url() {
        let mut s = generic();
        s.web_hook_url = "not a url".into();
        assert!(s.validate().is_err());
        s.web_hook_url = "http://hooks.local/cb".into();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_fields_round_trip() {
        let mut s = generic();
        s.is_unique = true;
        s.web_hook_url = "http://hooks.local/cb".into();
        s.check_in = "50%".into();
        s.check_in_at = 1_700_000_010;
        let mut params = Parameters::new();
        params.insert("x".into(), json!(1));
        s.parameters = Some(params);

        let map: HashMap<String, String> = s
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Stats::from_fields("abc", &map).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_from_fields_empty_is_not_found() {
        let err = Stats::from_fields("abc", &HashMap::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_fields_reads_ack_and_legacy_unique() {
        let mut map = HashMap::new();
        map.insert("status".to_string(), "Success".to_string());
        map.insert("unique".to_string(), "1".to_string());
        map.insert(
            "ack".to_string(),
            r#"{"status":"Running","revision":3,"check_in_at":0}"#.to_string(),
        );
        let s = Stats::from_fields("abc", &map).unwrap();
        assert!(s.is_unique);
        assert_eq!(s.job_id, "abc");
        assert_eq!(
            s.hook_ack,
            Some(AckHook {
                status: Status::Running,
                revision: 3,
                check_in_at: 0
            })
        );
    }
}
