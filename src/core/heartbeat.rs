//! Heartbeat records and their wire representation.
//!
//! A heartbeat is the atomic unit of telemetry: one timestamped record of
//! activity on one file. Heartbeats are immutable once created; the queue
//! wraps them with an id for acknowledgment.

use crate::activity::{ActivityEvent, Category};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity type sent for every heartbeat produced by this crate.
pub const ENTITY_TYPE: &str = "file";

/// Monotonic identifier assigned by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeartbeatId(pub u64);

impl std::fmt::Display for HeartbeatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of developer activity worth reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// File path the activity happened in
    pub entity: String,
    /// When the activity happened
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub category: Category,
    pub is_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_pos: Option<u64>,
}

impl Heartbeat {
    /// Build a heartbeat from an activity event.
    pub fn from_event(event: &ActivityEvent) -> Self {
        Self {
            entity: event.file_path.clone(),
            timestamp: event.timestamp,
            project: event.project.clone(),
            language: event.language.clone(),
            category: event.category.unwrap_or_default(),
            is_write: event.is_write,
            lineno: event.lineno,
            cursor_pos: event.cursor_pos,
        }
    }

    /// Unix time in fractional seconds, as the tracking service expects.
    pub fn unix_time(&self) -> f64 {
        self.timestamp.timestamp_millis() as f64 / 1000.0
    }

    /// Wire form of this heartbeat. `lines` is the file's line count when known.
    pub fn to_wire(&self, lines: Option<u64>) -> WireHeartbeat {
        WireHeartbeat {
            entity: self.entity.clone(),
            entity_type: ENTITY_TYPE.to_string(),
            time: self.unix_time(),
            category: self.category,
            is_write: self.is_write,
            project: self.project.clone(),
            language: self.language.clone(),
            lineno: self.lineno,
            cursorpos: self.cursor_pos,
            lines,
        }
    }
}

/// A heartbeat held by the queue, waiting for acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedHeartbeat {
    pub id: HeartbeatId,
    pub heartbeat: Heartbeat,
}

/// Heartbeat as serialized for the tracking service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireHeartbeat {
    pub entity: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub time: f64,
    pub category: Category,
    pub is_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursorpos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_event_defaults_category() {
        let event = ActivityEvent::edit("/src/lib.rs")
            .with_project("heartbeat")
            .with_cursor(10, 4);
        let heartbeat = Heartbeat::from_event(&event);

        assert_eq!(heartbeat.entity, "/src/lib.rs");
        assert_eq!(heartbeat.project.as_deref(), Some("heartbeat"));
        assert_eq!(heartbeat.category, Category::Coding);
        assert_eq!(heartbeat.lineno, Some(10));
        assert_eq!(heartbeat.cursor_pos, Some(4));
        assert!(!heartbeat.is_write);
    }

    #[test]
    fn test_wire_format_fields() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_500).unwrap();
        let heartbeat = Heartbeat::from_event(&ActivityEvent::save("/a.py").at(at));
        let wire = serde_json::to_value(heartbeat.to_wire(Some(42))).unwrap();

        assert_eq!(wire["entity"], "/a.py");
        assert_eq!(wire["type"], "file");
        assert_eq!(wire["time"], 1_700_000_000.5);
        assert_eq!(wire["category"], "coding");
        assert_eq!(wire["is_write"], true);
        assert_eq!(wire["lines"], 42);
        assert!(wire.get("project").is_none());
        assert!(wire.get("cursorpos").is_none());
    }
}
