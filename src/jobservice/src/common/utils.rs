//! Small helpers shared across modules.

use chrono::Utc;
use std::collections::BTreeMap;
use serde_json::{Map, Value};

/// Free-form job parameters as they travel on the wire.
pub type Parameters = Map<String, Value>;

/// Current wall-clock time in whole seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current wall-clock time in nanoseconds.
pub fn now_unix_nanos() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000))
}

/// A new random 24-hex-character identifier.
pub fn make_identifier() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

/// Deterministic JSON of a parameter map (keys are ordered).
pub fn canonical_json(params: &Parameters) -> String {
    let ordered: BTreeMap<&String, &Value> = params.iter().collect();
    serde_json::to_string(&ordered).unwrap_or_else(|_| "{}".to_string())
}

/// Whether `raw` parses as an absolute http(s) URL.
pub fn is_valid_url(raw: &str) -> bool {
    match reqwest::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host().is_some(),
        Err(_) => false,
    }
}

/// Host name of this machine, for worker pool heartbeats.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
