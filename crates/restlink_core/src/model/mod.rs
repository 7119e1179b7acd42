//! In-memory entity model shared by the session and backends.
//!
//! # Responsibility
//! - Define the identifier value type used as cache key.
//! - Define the live entity handle and its attribute values.
//!
//! # Invariants
//! - Two `Entity` handles compare equal only when they are the same instance.
//! - An assigned `EntityId` is never replaced on an instance.

pub mod entity;
pub mod entity_id;

/// Raw persisted/wire record: a JSON object keyed by property name.
pub type Record = serde_json::Map<String, serde_json::Value>;
