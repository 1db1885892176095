use serde::{Deserialize, Serialize};

use crate::common::utils::is_valid_url;
use crate::error::{JobServiceError, Result};
use crate::job::StatusChange;

/// Events older than this are dropped instead of resent.
pub const EVENT_EXPIRE_SECS: i64 = 24 * 3600;

/// A status change addressed to one web hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub url: String,
    #[serde(default)]
    pub message: String,
    pub data: StatusChange,
    /// Creation time in seconds
    pub timestamp: i64,
}

impl Event {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_url(&self.url) {
            return Err(JobServiceError::bad_request(format!(
                "Invalid hook event URL: {}",
                self.url
            )));
        }
        if self.data.job_id.is_empty() {
            return Err(JobServiceError::bad_request("Hook event carries no job ID"));
        }
        if self.data.metadata.is_none() {
            return Err(JobServiceError::bad_request("Hook event carries no job stats"));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.timestamp > 0 && now - self.timestamp >= EVENT_EXPIRE_SECS
    }

    /// `(revision, check_in_at)` of the stats snapshot the event was built from.
    pub fn revision_and_check_in(&self) -> (i64, i64) {
        self.data
            .metadata
            .as_ref()
            .map(|m| (m.revision, m.check_in_at))
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Stats, Status};

    fn event() -> Event {
        let mut stats = Stats::new("abc", "sample");
        stats.revision = 7;
        stats.check_in_at = 42;
        Event {
            url: "http://hooks.local/cb".into(),
            message: "Status of job abc changed to Running".into(),
            data: StatusChange {
                job_id: "abc".into(),
                status: Status::Running,
                check_in: None,
                metadata: Some(stats),
            },
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_validate() {
        assert!(event().validate().is_ok());

        let mut bad = event();
        bad.url = "ftp:/nowhere".into();
        assert!(bad.validate().is_err());

        let mut bad = event();
        bad.data.metadata = None;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_expiry_boundary() {
        let e = event();
        assert!(!e.is_expired(e.timestamp + EVENT_EXPIRE_SECS - 1));
        assert!(e.is_expired(e.timestamp + EVENT_EXPIRE_SECS));
    }

    #[test]
    fn test_json_round_trip() {
        let e = event();
        let raw = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.revision_and_check_in(), (7, 42));
    }
}
