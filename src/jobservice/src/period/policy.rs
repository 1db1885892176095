use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::common::utils::{canonical_json, is_valid_url};
use crate::common::Parameters;
use crate::error::{ErrorCode, JobServiceError, Result};

/// Cron of the daily maintenance jobs.
pub const DAILY_MIDNIGHT_CRON: &str = "0 0 0 * * *";

/// Jobs that must not be scheduled twice with identical parameters.
pub const WELL_KNOWN_JOBS: [&str; 4] = [
    "IMAGE_SCAN_ALL",
    "IMAGE_GC",
    "IMAGE_REPLICATE",
    "SYSTEM_ARTIFACT_CLEANUP",
];

/// Display-only classification of a cron spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronType {
    Daily,
    Weekly,
    Hourly,
    Custom,
    None,
}

/// A periodic policy, stored as JSON in `<ns>:period:policies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub job_name: String,
    pub cron_spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_params: Option<Parameters>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_type: Option<CronType>,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(JobServiceError::bad_request("Missing ID in periodic policy"));
        }
        if self.job_name.is_empty() {
            return Err(JobServiceError::bad_request("Missing job name in periodic policy"));
        }
        if !self.web_hook_url.is_empty() && !is_valid_url(&self.web_hook_url) {
            return Err(JobServiceError::bad_request(format!(
                "Invalid web hook URL in periodic policy: {}",
                self.web_hook_url
            )));
        }
        self.schedule().map(|_| ())
    }

    /// Parse the six-field cron spec.
    pub fn schedule(&self) -> Result<cron::Schedule> {
        parse_cron(&self.cron_spec)
    }

    /// Firings strictly after `from` and no later than `until`.
    pub fn firings_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<i64>> {
        let schedule = self.schedule()?;
        Ok(schedule
            .after(&from)
            .take_while(|t| *t <= until)
            .map(|t| t.timestamp())
            .collect())
    }

    pub fn params(&self) -> Parameters {
        self.job_params.clone().unwrap_or_default()
    }

    /// Whether `other` duplicates this policy under the well-known job rule.
    pub fn duplicates(&self, other: &Policy) -> bool {
        self.job_name == other.job_name
            && WELL_KNOWN_JOBS.contains(&self.job_name.as_str())
            && canonical_json(&self.params()) == canonical_json(&other.params())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Validate and parse a cron spec of exactly six fields.
pub fn parse_cron(spec: &str) -> Result<cron::Schedule> {
    let fields = spec.split_whitespace().count();
    if fields != 6 {
        return Err(JobServiceError::new(
            ErrorCode::InvalidCronSpec,
            format!("Cron spec '{}' must have 6 fields, found {}", spec, fields),
        ));
    }
    Ok(cron::Schedule::from_str(spec)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationEvent {
    Schedule,
    Unschedule,
}

/// Message published on `<ns>:period:policies:notifications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn policy(name: &str, params: serde_json::Value) -> Policy {
        Policy {
            id: "p1".into(),
            job_name: name.into(),
            cron_spec: "0 */5 * * * *".into(),
            job_params: params.as_object().cloned(),
            web_hook_url: String::new(),
            cron_type: None,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let mut p = policy("IMAGE_GC", json!({"dry_run": true}));
        p.web_hook_url = "http://core/service/notifications/jobs/webhook".into();
        p.cron_type = Some(CronType::Custom);
        let raw = p.to_json().unwrap();
        assert!(raw.contains(r#""job_params":{"dry_run":true}"#));
        assert_eq!(Policy::from_json(&raw).unwrap(), p);
    }

    #[test]
    fn test_cron_must_have_six_fields() {
        assert!(parse_cron(DAILY_MIDNIGHT_CRON).is_ok());
        let err = parse_cron("0 0 * * *").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronSpec);
        assert!(parse_cron("0 0 0 * * * 2030").is_err());
        assert!(parse_cron("x y z * * *").is_err());
    }

    #[test]
    fn test_firings_between() {
        let p = policy("IMAGE_GC", json!({}));
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        let firings = p.firings_between(from, until).unwrap();
        assert_eq!(firings, vec![from.timestamp() + 300, from.timestamp() + 600]);
    }

    #[test]
    fn test_duplicates_only_for_well_known_jobs() {
        let a = policy("IMAGE_GC", json!({"a": 1, "b": 2}));
        let b = policy("IMAGE_GC", json!({"b": 2, "a": 1}));
        assert!(a.duplicates(&b));

        let c = policy("IMAGE_GC", json!({"a": 2}));
        assert!(!a.duplicates(&c));

        let d = policy("REPLICATION", json!({}));
        let e = policy("REPLICATION", json!({}));
        assert!(!d.duplicates(&e));
    }

    #[test]
    fn test_notification_wire_format() {
        let n = Notification {
            event: NotificationEvent::Unschedule,
            id: "p1".into(),
        };
        assert_eq!(serde_json::to_string(&n).unwrap(), r#"{"event":"unschedule","id":"p1"}"#);
    }
}
