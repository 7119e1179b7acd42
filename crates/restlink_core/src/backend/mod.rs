//! Storage collaborator contract and bundled implementations.
//!
//! # Responsibility
//! - Define the continuation-passing `Backend` trait consumed by sessions.
//! - Provide an in-process store and a SQLite document store.
//!
//! # Invariants
//! - A backend calls each reply at most once, now or later.
//! - A reply may run synchronously inside the call that received it.
//! - `gets` may return fewer records than requested; omission means
//!   "not found", not failure.

use crate::db::DbError;
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::TypeDefinition;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod memory;
pub mod query;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use query::{QueryPlan, SortDirection, INDEX_OPTIONS};
pub use sqlite::{SqliteBackendConfig, SqliteDocumentBackend};

/// Opaque index query: property filters plus backend options such as
/// `_sort`, `_limit` and `_skip`.
pub type Query = Record;

pub type BackendResult<T> = Result<T, BackendError>;

/// Continuation invoked once with the outcome of a backend call.
pub type Reply<T> = Box<dyn FnOnce(BackendResult<T>)>;

#[derive(Debug)]
pub enum BackendError {
    /// Transport-level failure (connection lost, remote unreachable).
    Unavailable(String),
    Db(DbError),
    InvalidQuery(String),
    InvalidRecord(String),
    DuplicateId(EntityId),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "{message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidQuery(message) => write!(f, "invalid query: {message}"),
            Self::InvalidRecord(message) => write!(f, "invalid record: {message}"),
            Self::DuplicateId(id) => write!(f, "a record with id {id} already exists"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Unavailable(_)
            | Self::InvalidQuery(_)
            | Self::InvalidRecord(_)
            | Self::DuplicateId(_) => None,
        }
    }
}

impl From<DbError> for BackendError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Storage contract for one kind of persistence (document store, REST
/// service, ...). Each backend's constructor plays the role of `init`.
///
/// Every record crossing this boundary is in wire form: references are
/// `{"id": ...}` objects and the record id lives under `"id"`.
pub trait Backend {
    /// Returns records of `kind` matching `query`.
    fn index(&self, kind: &TypeDefinition, query: &Query, reply: Reply<Vec<Record>>);

    /// Returns distinct values of `key` over records matching `query`.
    fn distinct(&self, kind: &TypeDefinition, key: &str, query: &Query, reply: Reply<Vec<Value>>);

    /// Returns the records with the given ids; missing ids are omitted.
    fn gets(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<Vec<Record>>);

    /// Sets the properties in `data` on every listed record.
    ///
    /// Without a reply the caller does not wait for confirmation, and the
    /// backend may skip acknowledging the write.
    fn update(
        &self,
        kind: &TypeDefinition,
        ids: &[EntityId],
        data: &Record,
        reply: Option<Reply<()>>,
    );

    fn delete(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<()>);

    /// Stores a new record and replies with it, carrying its assigned id.
    fn insert(&self, kind: &TypeDefinition, record: Record, reply: Reply<Record>);

    /// Removes every record of `kind`.
    fn clear_all(&self, kind: &TypeDefinition, reply: Reply<()>);
}
