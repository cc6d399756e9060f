//! Persisted snapshot format
//!
//! A replica persists its state as a 3-element tuple
//! `[writer_id, timestamp, state]`. Anything else found in the slot is a
//! bare legacy state value written before versioning existed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the engine instance that produced a snapshot
pub type WriterId = String;

/// A replica's believed-current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The state tree
    pub value: Value,
    /// Writer that produced this snapshot ("" for legacy values)
    pub writer_id: WriterId,
    /// Writer-local logical clock
    pub timestamp: i64,
}

impl StateSnapshot {
    pub fn new(value: Value, writer_id: impl Into<WriterId>, timestamp: i64) -> Self {
        Self {
            value,
            writer_id: writer_id.into(),
            timestamp,
        }
    }

    /// Encode as the persisted tuple
    pub fn pack(&self) -> Value {
        Value::Array(vec![
            Value::String(self.writer_id.clone()),
            Value::from(self.timestamp),
            self.value.clone(),
        ])
    }
}

/// A value read from the persisted slot, decoded once at the storage boundary
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedPayload {
    /// `[writer_id, timestamp, state]`
    Versioned(StateSnapshot),
    /// Any other shape, taken as a bare state value
    Legacy(Value),
}

impl PersistedPayload {
    /// Decode a raw slot value
    pub fn decode(raw: Value) -> Self {
        match raw {
            Value::Array(mut items) if is_versioned(&items) => {
                let value = items.pop().unwrap_or(Value::Null);
                let timestamp = items.pop().as_ref().and_then(timestamp_of).unwrap_or(0);
                let writer_id = match items.pop() {
                    Some(Value::String(id)) => id,
                    _ => String::new(),
                };
                PersistedPayload::Versioned(StateSnapshot {
                    value,
                    writer_id,
                    timestamp,
                })
            }
            other => PersistedPayload::Legacy(other),
        }
    }

    /// The decoded state value
    pub fn value(&self) -> &Value {
        match self {
            PersistedPayload::Versioned(snapshot) => &snapshot.value,
            PersistedPayload::Legacy(value) => value,
        }
    }

    /// Convert into a snapshot; legacy values get an empty writer and time 0
    pub fn into_snapshot(self) -> StateSnapshot {
        match self {
            PersistedPayload::Versioned(snapshot) => snapshot,
            PersistedPayload::Legacy(value) => StateSnapshot::new(value, "", 0),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, PersistedPayload::Legacy(_))
    }
}

fn is_versioned(items: &[Value]) -> bool {
    items.len() == 3 && items[0].is_string() && items[1].is_number()
}

fn timestamp_of(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|ts| ts as i64))
}
