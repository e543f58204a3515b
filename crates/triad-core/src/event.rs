use crate::error::{Result, TriadError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type names written by triad itself. Callers may append any other
/// dotted name through the CLI.
pub mod kinds {
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRIED: &str = "task.retried";
    pub const TASK_REQUEUED: &str = "task.requeued";

    pub const WORKER_SPAWNED: &str = "worker.spawned";
    pub const WORKER_REGISTERED: &str = "worker.registered";
    pub const WORKER_HEARTBEAT: &str = "worker.heartbeat";
    pub const WORKER_EXITED: &str = "worker.exited";
    pub const WORKER_RECOVERED: &str = "worker.recovered";

    pub const CONSENSUS_EVALUATED: &str = "consensus.evaluated";
}

/// One record of the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value, source: Option<String>) -> Result<Self> {
        let event_type = event_type.into();
        validate_event_type(&event_type)?;
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            source,
            payload,
        })
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn is_a(&self, prefix: &str) -> bool {
        self.event_type == prefix
            || (self.event_type.starts_with(prefix)
                && (prefix.ends_with('.')
                    || self.event_type.as_bytes().get(prefix.len()) == Some(&b'.')))
    }
}

/// Event types are dotted lowercase words: `task.completed`, `worker.heartbeat`.
pub fn validate_event_type(s: &str) -> Result<()> {
    let ok = !s.is_empty()
        && s.len() <= 128
        && s.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        });
    if ok {
        Ok(())
    } else {
        Err(TriadError::InvalidEventType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_type_key() {
        let e = Event::new("task.queued", json!({"task_id": "t1"}), Some("cli".into())).unwrap();
        let v: Value = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "task.queued");
        assert_eq!(v["payload"]["task_id"], "t1");
        assert_eq!(v["source"], "cli");
        assert!(v.get("event_type").is_none());
    }

    #[test]
    fn parses_minimal_line() {
        let line = r#"{"id":"6f1c1a4e-5d3b-4a8e-9a9e-2b7f0d1c3e4f","type":"x.y","timestamp":"2025-01-01T00:00:00Z"}"#;
        let e: Event = serde_json::from_str(line).unwrap();
        assert_eq!(e.event_type, "x.y");
        assert!(e.source.is_none());
        assert!(e.payload.is_null());
    }

    #[test]
    fn missing_id_is_rejected() {
        let line = r#"{"type":"x.y","timestamp":"2025-01-01T00:00:00Z","payload":{}}"#;
        assert!(serde_json::from_str::<Event>(line).is_err());
    }

    #[test]
    fn event_type_validation() {
        for ok in ["task.queued", "a", "worker.heartbeat", "custom_1.sub-event"] {
            validate_event_type(ok).unwrap();
        }
        for bad in ["", "Task.Queued", "a..b", ".a", "a.", "has space"] {
            assert!(validate_event_type(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn prefix_matching() {
        let e = Event::new("task.completed", Value::Null, None).unwrap();
        assert!(e.is_a("task"));
        assert!(e.is_a("task."));
        assert!(e.is_a("task.completed"));
        assert!(!e.is_a("tas"));
        assert!(!e.is_a("worker"));
    }
}
