// Documents: key-addressed JSON payloads plus system metadata

use crate::backend::format_timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Document payload: an ordered mapping of field names to JSON values.
pub type Data = serde_json::Map<String, Value>;

/// Fields injected on read. Never stored inside a payload.
pub const RESERVED_FIELDS: [&str; 4] = ["_id", "_key", "_rev", "_updated"];

/// Revision marker written on every put.
///
/// TODO: lock the row and compare the caller's revision before overwriting;
/// until then concurrent puts on one key are last-write-wins.
pub const PLACEHOLDER_REV: &str = "0";

/// A stored document with its system metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub key: String,
    pub rev: String,
    pub updated: Option<DateTime<Utc>>,
    pub data: Data,
}

impl Document {
    /// The payload with `_id`, `_key`, `_rev` and `_updated` injected.
    pub fn to_value(&self) -> Value {
        self.clone().into_value()
    }

    pub fn into_value(self) -> Value {
        let mut obj = self.data;
        obj.insert("_id".into(), Value::from(self.id));
        obj.insert("_key".into(), Value::String(self.key));
        obj.insert("_rev".into(), Value::String(self.rev));
        obj.insert(
            "_updated".into(),
            self.updated
                .map(|ts| Value::String(format_timestamp(&ts)))
                .unwrap_or(Value::Null),
        );
        Value::Object(obj)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// Outcome of a single put.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PutResult {
    pub id: i64,
    pub key: String,
    pub rev: String,
    pub updated: DateTime<Utc>,
}

/// Remove reserved metadata fields from an incoming payload.
/// Returns how many were removed.
pub(crate) fn strip_reserved(data: &mut Data) -> usize {
    RESERVED_FIELDS
        .iter()
        .filter(|field| data.shift_remove(**field).is_some())
        .count()
}

/// The payload handed to map functions: data plus `_id` and `_key`.
pub(crate) fn augment(data: &Data, id: i64, key: &str) -> Data {
    let mut doc = data.clone();
    doc.insert("_id".into(), Value::from(id));
    doc.insert("_key".into(), Value::String(key.to_string()));
    doc
}
