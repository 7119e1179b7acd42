//! SQLite-backed document store.
//!
//! # Responsibility
//! - Persist wire records as JSON documents grouped by entity type.
//! - Answer every `Backend` call synchronously, before returning.
//!
//! # Invariants
//! - `(kind, id)` is unique; ids are stored as their JSON text.
//! - Stored bodies never contain the `id` property; it is re-attached on read.
//! - Default order is newest first (descending insertion sequence).

use super::query::{check_field_name, distinct_values, merge_set, QueryPlan};
use super::{Backend, BackendError, BackendResult, Query, Reply};
use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::TypeDefinition;
use log::{debug, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for `SqliteDocumentBackend::init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteBackendConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl SqliteBackendConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Document store over one SQLite connection.
pub struct SqliteDocumentBackend {
    conn: Connection,
}

impl SqliteDocumentBackend {
    /// Opens (and migrates) the configured database.
    pub fn init(config: &SqliteBackendConfig) -> Result<Self, DbError> {
        let conn = match &config.path {
            Some(path) => open_db(path, config.busy_timeout())?,
            None => {
                let conn = open_db_in_memory()?;
                conn.busy_timeout(config.busy_timeout())?;
                conn
            }
        };
        Ok(Self { conn })
    }

    /// Wraps a connection that already went through `db::open_db*`.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn load_kind(&self, kind: &str) -> BackendResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT id_json, body
             FROM documents
             WHERE kind = ?1
             ORDER BY seq DESC;",
        )?;
        let mut rows = stmt.query([kind])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_document(row.get(0)?, row.get(1)?)?);
        }
        Ok(records)
    }

    fn index_documents(&self, kind: &str, query: &Query) -> BackendResult<Vec<Record>> {
        let plan = QueryPlan::parse(query)?;
        Ok(plan.apply(self.load_kind(kind)?))
    }

    fn distinct_documents(&self, kind: &str, key: &str, query: &Query) -> BackendResult<Vec<Value>> {
        check_field_name(key)?;
        let plan = QueryPlan::parse(query)?;
        let matching = plan.apply(self.load_kind(kind)?);
        Ok(distinct_values(&matching, key))
    }

    fn get_documents(&self, kind: &str, ids: &[EntityId]) -> BackendResult<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id_json, body
             FROM documents
             WHERE kind = ? AND id_json IN ({placeholders});"
        );
        let mut bind_values = vec![SqlValue::Text(kind.to_string())];
        bind_values.extend(ids.iter().map(|id| SqlValue::Text(encode_id(id))));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut found: HashMap<EntityId, Record> = HashMap::new();
        while let Some(row) = rows.next()? {
            let record = decode_document(row.get(0)?, row.get(1)?)?;
            if let Some(id) = EntityId::from_record(&record) {
                found.insert(id, record);
            }
        }

        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    fn update_documents(&self, kind: &str, ids: &[EntityId], data: &Record) -> BackendResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            let id_json = encode_id(id);
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM documents WHERE kind = ?1 AND id_json = ?2;",
                    params![kind, id_json],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(body) = body else {
                continue;
            };

            let mut stored = decode_body(&id_json, &body)?;
            merge_set(&mut stored, data);
            tx.execute(
                "UPDATE documents
                 SET
                    body = ?1,
                    updated_at = (strftime('%s', 'now') * 1000)
                 WHERE kind = ?2 AND id_json = ?3;",
                params![encode_body(&stored)?, kind, id_json],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_documents(&self, kind: &str, ids: &[EntityId]) -> BackendResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "DELETE FROM documents WHERE kind = ?1 AND id_json = ?2;",
                params![kind, encode_id(id)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_document(&self, kind: &str, mut record: Record) -> BackendResult<Record> {
        let id = match record.remove("id") {
            Some(Value::Null) | None => EntityId::generate(),
            Some(value) => EntityId::from_json(&value).ok_or_else(|| {
                BackendError::InvalidRecord(format!("unsupported id value {value}"))
            })?,
        };

        let inserted = self.conn.execute(
            "INSERT INTO documents (kind, id_json, body) VALUES (?1, ?2, ?3);",
            params![kind, encode_id(&id), encode_body(&record)?],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                return Err(BackendError::DuplicateId(id));
            }
            Err(err) => return Err(err.into()),
        }

        record.insert("id".to_string(), id.to_json());
        Ok(record)
    }

    fn clear_documents(&self, kind: &str) -> BackendResult<()> {
        let removed = self
            .conn
            .execute("DELETE FROM documents WHERE kind = ?1;", [kind])?;
        debug!("event=backend_clear module=sqlite status=ok kind={kind} removed={removed}");
        Ok(())
    }
}

impl Backend for SqliteDocumentBackend {
    fn index(&self, kind: &TypeDefinition, query: &Query, reply: Reply<Vec<Record>>) {
        reply(logged("index", kind, self.index_documents(kind.name(), query)));
    }

    fn distinct(&self, kind: &TypeDefinition, key: &str, query: &Query, reply: Reply<Vec<Value>>) {
        reply(logged(
            "distinct",
            kind,
            self.distinct_documents(kind.name(), key, query),
        ));
    }

    fn gets(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<Vec<Record>>) {
        reply(logged("gets", kind, self.get_documents(kind.name(), ids)));
    }

    fn update(
        &self,
        kind: &TypeDefinition,
        ids: &[EntityId],
        data: &Record,
        reply: Option<Reply<()>>,
    ) {
        let result = logged("update", kind, self.update_documents(kind.name(), ids, data));
        if let Some(reply) = reply {
            reply(result);
        }
    }

    fn delete(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<()>) {
        reply(logged("delete", kind, self.delete_documents(kind.name(), ids)));
    }

    fn insert(&self, kind: &TypeDefinition, record: Record, reply: Reply<Record>) {
        reply(logged("insert", kind, self.insert_document(kind.name(), record)));
    }

    fn clear_all(&self, kind: &TypeDefinition, reply: Reply<()>) {
        reply(logged("clear_all", kind, self.clear_documents(kind.name())));
    }
}

fn logged<T>(operation: &str, kind: &TypeDefinition, result: BackendResult<T>) -> BackendResult<T> {
    if let Err(err) = &result {
        warn!(
            "event=backend_call module=sqlite status=error op={} kind={} error={}",
            operation,
            kind.name(),
            err
        );
    }
    result
}

fn encode_id(id: &EntityId) -> String {
    id.to_json().to_string()
}

fn encode_body(record: &Record) -> BackendResult<String> {
    serde_json::to_string(record)
        .map_err(|err| BackendError::InvalidRecord(format!("cannot serialize record: {err}")))
}

fn decode_body(id_json: &str, body: &str) -> BackendResult<Record> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DbError::corrupt(id_json, "body is not a JSON object").into()),
        Err(err) => Err(DbError::corrupt(id_json, format!("invalid JSON body: {err}")).into()),
    }
}

fn decode_document(id_json: String, body: String) -> BackendResult<Record> {
    let id = serde_json::from_str::<Value>(&id_json)
        .ok()
        .and_then(|value| EntityId::from_json(&value))
        .ok_or_else(|| DbError::corrupt(&id_json, "id is neither a string nor an integer"))?;
    let mut record = decode_body(&id_json, &body)?;
    record.insert("id".to_string(), id.to_json());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::{decode_document, encode_id, SqliteBackendConfig};
    use crate::backend::BackendError;
    use crate::db::DbError;
    use crate::model::entity_id::EntityId;
    use serde_json::json;

    #[test]
    fn ids_encode_as_json_text() {
        assert_eq!(encode_id(&EntityId::from("abc")), "\"abc\"");
        assert_eq!(encode_id(&EntityId::Int(42)), "42");
    }

    #[test]
    fn decode_reattaches_id() {
        let record = decode_document("7".to_string(), r#"{"name":"Rex"}"#.to_string()).unwrap();
        assert_eq!(record["id"], json!(7));
        assert_eq!(record["name"], json!("Rex"));
    }

    #[test]
    fn decode_rejects_non_object_body() {
        match decode_document("\"a\"".to_string(), "[1]".to_string()) {
            Err(BackendError::Db(DbError::CorruptDocument { id_json, .. })) => {
                assert_eq!(id_json, "\"a\"");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SqliteBackendConfig =
            serde_json::from_value(json!({"path": "/tmp/store.db"})).unwrap();
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(config.path.is_some());
        assert!(SqliteBackendConfig::in_memory().path.is_none());
    }
}
