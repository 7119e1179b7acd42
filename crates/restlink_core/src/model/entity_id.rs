//! Entity identifier value type.
//!
//! # Responsibility
//! - Give cache keys a defined equality and hash.
//! - Convert backend-native JSON identifiers at one explicit boundary.
//!
//! # Invariants
//! - `Int(1)` and `Text("1")` are different ids; backends must be consistent.
//! - Empty strings are never valid ids.

use super::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one persisted entity within its entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    /// Generates a fresh random text id, as assigned by document backends.
    pub fn generate() -> Self {
        Self::Text(Uuid::new_v4().simple().to_string())
    }

    /// Converts a scalar JSON value into an id.
    ///
    /// Returns `None` for null, empty strings, non-integer numbers and
    /// composite values.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) if !text.trim().is_empty() => Some(Self::Text(text.clone())),
            Value::Number(number) => number.as_i64().map(Self::Int),
            _ => None,
        }
    }

    /// Reads the id carried by a reference value: either a bare scalar id or
    /// an object with an `id` property.
    pub fn from_reference(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => map.get("id").and_then(Self::from_json),
            other => Self::from_json(other),
        }
    }

    /// Reads the `id` property of a record.
    pub fn from_record(record: &Record) -> Option<Self> {
        record.get("id").and_then(Self::from_json)
    }

    /// Returns the JSON form used in wire records.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self::Text(value.simple().to_string())
    }
}
