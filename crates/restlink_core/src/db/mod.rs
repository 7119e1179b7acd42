//! SQLite storage bootstrap for the document backend.
//!
//! # Responsibility
//! - Open and configure SQLite connections.
//! - Apply document-store migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No document is read or written before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use migrations::MigrationReport;
pub use open::{open_db, open_db_in_memory, DEFAULT_BUSY_TIMEOUT};

pub type DbResult<T> = Result<T, DbError>;

/// Failure of the SQLite file below the backend contract.
///
/// `SchemaTooNew` is raised while opening, before any document is read.
/// `CorruptDocument` is raised while decoding a stored row; the rest of the
/// file stays usable.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The file was migrated by a newer build.
    SchemaTooNew { found: u32, supported: u32 },
    /// A row whose id or body no longer decodes.
    CorruptDocument { id_json: String, reason: String },
}

impl DbError {
    pub(crate) fn corrupt(id_json: &str, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            id_json: id_json.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "document store is at schema version {found}, this build knows up to {supported}"
            ),
            Self::CorruptDocument { id_json, reason } => {
                write!(f, "stored document {id_json} is corrupt: {reason}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
