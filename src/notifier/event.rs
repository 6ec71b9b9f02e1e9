//! Change events produced by committed writes, and the deltas pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One written row. `previous` is absent for inserts, `current` for deletes.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub previous: Option<Map<String, Value>>,
    pub current: Option<Map<String, Value>>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, current: Map<String, Value>) -> Self {
        ChangeEvent {
            table: table.into(),
            kind: ChangeKind::Insert,
            previous: None,
            current: Some(current),
        }
    }

    pub fn update(table: impl Into<String>, previous: Map<String, Value>, current: Map<String, Value>) -> Self {
        ChangeEvent {
            table: table.into(),
            kind: ChangeKind::Update,
            previous: Some(previous),
            current: Some(current),
        }
    }

    pub fn delete(table: impl Into<String>, previous: Map<String, Value>) -> Self {
        ChangeEvent {
            table: table.into(),
            kind: ChangeKind::Delete,
            previous: Some(previous),
            current: None,
        }
    }
}

/// Payload of one `change` event on a stream.
#[derive(Clone, Debug, Serialize)]
pub struct Delta {
    pub previous: Vec<Value>,
    pub current: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Delta {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Delta {
            previous: event.previous.iter().cloned().map(Value::Object).collect(),
            current: event.current.iter().cloned().map(Value::Object).collect(),
            timestamp: Utc::now(),
        }
    }
}
