//! Versioned layout of the document store.
//!
//! # Invariants
//! - Steps are listed by increasing `version`, starting at 1 without gaps.
//! - `PRAGMA user_version` equals the last applied step.
//! - Pending steps run in one transaction; on failure the file keeps its
//!   previous version.

use crate::db::{DbError, DbResult};
use log::debug;
use rusqlite::Connection;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[Step {
    version: 1,
    name: "documents",
    sql: include_str!("0001_documents.sql"),
}];

/// Schema versions before and after one `apply_migrations` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
}

impl MigrationReport {
    pub fn applied(&self) -> u32 {
        self.to - self.from
    }
}

/// Newest schema version this build can open.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Brings the document store up to `latest_version()`.
///
/// # Errors
/// - `SchemaTooNew` when the file is ahead of this build; nothing is changed.
/// - `Sqlite` when a step fails; the transaction is rolled back.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<MigrationReport> {
    let found = schema_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(DbError::SchemaTooNew { found, supported });
    }

    let pending = STEPS
        .iter()
        .skip_while(|step| step.version <= found)
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Ok(MigrationReport {
            from: found,
            to: found,
        });
    }

    let tx = conn.transaction()?;
    for step in pending {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        debug!(
            "event=db_migrate module=db status=ok version={} step={}",
            step.version, step.name
        );
    }
    tx.commit()?;

    Ok(MigrationReport {
        from: found,
        to: supported,
    })
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
