//! Session-scoped entity layer over pluggable document backends.
//! Schema-described entity types are loaded, linked and persisted through
//! sessions that guarantee one instance per id.

pub mod backend;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod schema;
pub mod session;

pub use backend::{
    Backend, BackendError, BackendResult, MemoryBackend, Query, Reply, SqliteBackendConfig,
    SqliteDocumentBackend,
};
pub use error::{CoreError, CoreResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::entity::{Attr, Entity, WeakEntity};
pub use model::entity_id::EntityId;
pub use model::Record;
pub use schema::{Registry, Schema, TypeDefinition};
pub use session::{Callback, Completion, EntityHandle, Factory, Fetched, Session};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
