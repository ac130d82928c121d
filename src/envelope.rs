//! JSON message envelope
//!
//! Wire schema:
//!
//! ```text
//! {"type": string, "id": string, "timestamp": u64 ms, "priority": 0..3, "data": <json>}
//! ```
//!
//! Decoding is lenient: a missing `timestamp` becomes "now", a missing
//! `priority` becomes [`Priority::Normal`], missing `data` becomes `{}`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;

/// Envelope `type` values understood by the session layer
pub mod kind {
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const NOTIFICATION: &str = "notification";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ERROR: &str = "error";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PUBLISH: &str = "publish";
}

/// Dispatch priority; higher values go first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u64", into = "u8")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl From<u64> for Priority {
    /// Values above 3 saturate to `Urgent`
    fn from(value: u64) -> Self {
        match value {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority::from(value as u64)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

/// Milliseconds since the Unix epoch
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn empty_object() -> Value {
    json!({})
}

/// One application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default = "timestamp_ms")]
    pub timestamp: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "empty_object")]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(kind: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            timestamp: timestamp_ms(),
            priority: Priority::Normal,
            data,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Decode from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode to JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interpret raw data: embedded JSON if it parses, otherwise a string
    pub fn raw_data(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    /// `data.request_id` of a response envelope
    pub fn correlation_id(&self) -> Option<&str> {
        self.data.get("request_id").and_then(Value::as_str)
    }

    /// String field of `data`
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Whether the envelope has the given `type`
    #[inline]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Per-connection id sequence
///
/// Ids are `{prefix}_{n}` with `n` counting up from 1.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Next unique id, `{prefix}_{n}` with `n` counting from 1
    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let env = Envelope {
            kind: kind::REQUEST.to_string(),
            id: "c_1".to_string(),
            timestamp: 1_700_000_000_000,
            priority: Priority::High,
            data: json!({"query_type": "status"}),
        };
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "id": "c_1",
                "timestamp": 1_700_000_000_000u64,
                "priority": 2,
                "data": {"query_type": "status"}
            })
        );
    }

    #[test]
    fn test_lenient_decode() {
        let env = Envelope::from_json(r#"{"type": "notification", "id": "n1"}"#).unwrap();
        assert_eq!(env.priority, Priority::Normal);
        assert_eq!(env.data, json!({}));
        assert!(env.timestamp > 0);

        assert!(Envelope::from_json(r#"{"id": "no-type"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn test_priority_saturates() {
        let env = Envelope::from_json(r#"{"type": "x", "priority": 9}"#).unwrap();
        assert_eq!(env.priority, Priority::Urgent);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Normal);
    }

    #[test]
    fn test_string_data() {
        let env = Envelope::from_json(r#"{"type": "x", "data": "plain"}"#).unwrap();
        assert_eq!(env.data, Value::String("plain".into()));
        assert_eq!(Envelope::raw_data(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(Envelope::raw_data("not json"), json!("not json"));
    }

    #[test]
    fn test_correlation_id() {
        let env = Envelope::new(kind::RESPONSE, "r1", json!({"request_id": "c_7", "success": true}));
        assert_eq!(env.correlation_id(), Some("c_7"));
        assert_eq!(Envelope::new(kind::RESPONSE, "r2", json!({})).correlation_id(), None);
    }

    #[test]
    fn test_ids_unique() {
        let ids = IdGenerator::new("client");
        assert_eq!(ids.next_id(), "client_1");
        assert_eq!(ids.next_id(), "client_2");
    }
}
