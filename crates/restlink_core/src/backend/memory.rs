//! In-process document store.
//!
//! # Responsibility
//! - Implement the `Backend` contract without external storage.
//! - Let callers control reply timing (`deferred`) and inject failures, so
//!   interleavings of concurrent session operations can be reproduced.
//!
//! # Invariants
//! - In deferred mode the store is read and written when a reply is
//!   flushed, not when the call is made.
//! - Replies never run while the store is borrowed.

use super::query::{check_field_name, distinct_values, merge_set, QueryPlan};
use super::{Backend, BackendError, BackendResult, Query, Reply};
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::TypeDefinition;
use log::{debug, warn};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

type Job = Box<dyn FnOnce()>;

#[derive(Default)]
struct MemoryStore {
    // Insertion order; index returns newest first.
    collections: BTreeMap<String, Vec<Record>>,
}

impl MemoryStore {
    fn collection(&mut self, kind: &str) -> &mut Vec<Record> {
        self.collections.entry(kind.to_string()).or_default()
    }

    fn newest_first(&self, kind: &str) -> Vec<Record> {
        self.collections
            .get(kind)
            .map(|records| records.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn position(&self, kind: &str, id: &EntityId) -> Option<usize> {
        self.collections.get(kind)?.iter().position(|record| {
            EntityId::from_record(record).as_ref() == Some(id)
        })
    }
}

/// `Backend` over process memory.
#[derive(Default)]
pub struct MemoryBackend {
    store: Rc<RefCell<MemoryStore>>,
    deferred: bool,
    queue: RefCell<VecDeque<Job>>,
    calls: RefCell<BTreeMap<&'static str, usize>>,
    fail_next: RefCell<Option<String>>,
    flushing: Cell<bool>,
}

impl MemoryBackend {
    /// Backend that replies synchronously inside each call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that queues every reply until `flush` or `run_next`.
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    /// Stores a record directly, bypassing counters and deferral.
    ///
    /// Returns the record id, generating one when absent.
    pub fn seed(&self, kind: &str, mut record: Record) -> EntityId {
        let id = EntityId::from_record(&record).unwrap_or_else(EntityId::generate);
        record.insert("id".to_string(), id.to_json());
        self.store.borrow_mut().collection(kind).push(record);
        id
    }

    /// Returns the stored record, if any.
    pub fn document(&self, kind: &str, id: &EntityId) -> Option<Record> {
        let store = self.store.borrow();
        let position = store.position(kind, id)?;
        store.collections.get(kind)?.get(position).cloned()
    }

    pub fn len(&self, kind: &str) -> usize {
        self.store
            .borrow()
            .collections
            .get(kind)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, kind: &str) -> bool {
        self.len(kind) == 0
    }

    /// Number of calls received for one operation (`"gets"`, `"index"`, ...).
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.borrow().get(operation).copied().unwrap_or(0)
    }

    /// Makes the next backend call fail with `Unavailable(message)`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.borrow_mut() = Some(message.into());
    }

    /// Number of queued replies in deferred mode.
    pub fn pending_replies(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs the oldest queued reply. Returns `false` when the queue is empty.
    pub fn run_next(&self) -> bool {
        let job = self.queue.borrow_mut().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs queued replies, including ones queued while flushing, until the
    /// queue is empty. Returns how many ran.
    pub fn flush(&self) -> usize {
        if self.flushing.replace(true) {
            return 0;
        }
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        self.flushing.set(false);
        ran
    }

    fn dispatch<T: 'static>(
        &self,
        operation: &'static str,
        kind: &TypeDefinition,
        work: impl FnOnce(&mut MemoryStore) -> BackendResult<T> + 'static,
        reply: Reply<T>,
    ) {
        *self.calls.borrow_mut().entry(operation).or_insert(0) += 1;
        debug!(
            "event=backend_call module=memory status=start op={} kind={} deferred={}",
            operation,
            kind.name(),
            self.deferred
        );

        let injected = self.fail_next.borrow_mut().take();
        let store = Rc::clone(&self.store);
        let kind_name = kind.name().to_string();
        let job: Job = Box::new(move || {
            let result = match injected {
                Some(message) => Err(BackendError::Unavailable(message)),
                None => work(&mut store.borrow_mut()),
            };
            if let Err(err) = &result {
                warn!(
                    "event=backend_call module=memory status=error op={} kind={} error={}",
                    operation, kind_name, err
                );
            }
            reply(result);
        });

        if self.deferred {
            self.queue.borrow_mut().push_back(job);
        } else {
            job();
        }
    }
}

impl Backend for MemoryBackend {
    fn index(&self, kind: &TypeDefinition, query: &Query, reply: Reply<Vec<Record>>) {
        let name = kind.name().to_string();
        let query = query.clone();
        self.dispatch(
            "index",
            kind,
            move |store| {
                let plan = QueryPlan::parse(&query)?;
                Ok(plan.apply(store.newest_first(&name)))
            },
            reply,
        );
    }

    fn distinct(&self, kind: &TypeDefinition, key: &str, query: &Query, reply: Reply<Vec<Value>>) {
        let name = kind.name().to_string();
        let key = key.to_string();
        let query = query.clone();
        self.dispatch(
            "distinct",
            kind,
            move |store| {
                check_field_name(&key)?;
                let plan = QueryPlan::parse(&query)?;
                let matching = plan.apply(store.newest_first(&name));
                Ok(distinct_values(&matching, &key))
            },
            reply,
        );
    }

    fn gets(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<Vec<Record>>) {
        let name = kind.name().to_string();
        let ids = ids.to_vec();
        self.dispatch(
            "gets",
            kind,
            move |store| {
                let Some(records) = store.collections.get(&name) else {
                    return Ok(Vec::new());
                };
                Ok(ids
                    .iter()
                    .filter_map(|id| {
                        records
                            .iter()
                            .find(|record| EntityId::from_record(record).as_ref() == Some(id))
                            .cloned()
                    })
                    .collect())
            },
            reply,
        );
    }

    fn update(
        &self,
        kind: &TypeDefinition,
        ids: &[EntityId],
        data: &Record,
        reply: Option<Reply<()>>,
    ) {
        let name = kind.name().to_string();
        let ids = ids.to_vec();
        let data = data.clone();
        let reply: Reply<()> = match reply {
            Some(reply) => reply,
            None => Box::new(|_| {}),
        };
        self.dispatch(
            "update",
            kind,
            move |store| {
                for id in &ids {
                    if let Some(position) = store.position(&name, id) {
                        merge_set(&mut store.collection(&name)[position], &data);
                    }
                }
                Ok(())
            },
            reply,
        );
    }

    fn delete(&self, kind: &TypeDefinition, ids: &[EntityId], reply: Reply<()>) {
        let name = kind.name().to_string();
        let ids = ids.to_vec();
        self.dispatch(
            "delete",
            kind,
            move |store| {
                store.collection(&name).retain(|record| {
                    EntityId::from_record(record).map_or(true, |id| !ids.contains(&id))
                });
                Ok(())
            },
            reply,
        );
    }

    fn insert(&self, kind: &TypeDefinition, record: Record, reply: Reply<Record>) {
        let name = kind.name().to_string();
        self.dispatch(
            "insert",
            kind,
            move |store| {
                let mut record = record;
                let id = match record.get("id") {
                    Some(Value::Null) | None => EntityId::generate(),
                    Some(value) => EntityId::from_json(value).ok_or_else(|| {
                        BackendError::InvalidRecord(format!("unsupported id value {value}"))
                    })?,
                };
                if store.position(&name, &id).is_some() {
                    return Err(BackendError::DuplicateId(id));
                }
                record.insert("id".to_string(), id.to_json());
                store.collection(&name).push(record.clone());
                Ok(record)
            },
            reply,
        );
    }

    fn clear_all(&self, kind: &TypeDefinition, reply: Reply<()>) {
        let name = kind.name().to_string();
        self.dispatch(
            "clear_all",
            kind,
            move |store| {
                store.collections.remove(&name);
                Ok(())
            },
            reply,
        );
    }
}
