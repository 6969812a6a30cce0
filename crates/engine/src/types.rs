use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Full detail for one run as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run_id: String,
    /// Engine-native status string (e.g. `"SUCCESS"`, `"STARTED"`).
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub update_time: Option<OffsetDateTime>,
    /// Run configuration document, opaque to the engine client.
    pub config: serde_json::Value,
    /// Raw events in the order the engine returned them (chronological).
    pub events: Vec<serde_json::Value>,
}

/// A recently updated run, as returned by the engine's run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Parse an engine timestamp: fractional seconds since the Unix epoch,
/// given either as a JSON number or as a numeric string.
///
/// Returns `None` for anything else, including non-finite values.
pub fn epoch_seconds(value: &serde_json::Value) -> Option<OffsetDateTime> {
    let secs = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !secs.is_finite() {
        return None;
    }
    let nanos = (secs * 1_000_000_000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn epoch_seconds_from_number() {
        let ts = epoch_seconds(&json!(100)).unwrap();
        assert_eq!(ts.unix_timestamp(), 100);
    }

    #[test]
    fn epoch_seconds_from_fractional_string() {
        let ts = epoch_seconds(&json!("1700000000.5")).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
        assert_eq!(ts.millisecond(), 500);
    }

    #[test]
    fn epoch_seconds_rejects_garbage() {
        assert!(epoch_seconds(&json!("yesterday")).is_none());
        assert!(epoch_seconds(&json!(null)).is_none());
        assert!(epoch_seconds(&json!({"t": 1})).is_none());
    }
}
