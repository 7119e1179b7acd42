//! Per-unit-of-work sessions over a shared registry and backend.
//!
//! # Responsibility
//! - Build sessions from a `Factory` holding the registry and backend.
//! - Own the identity cache and coalesce concurrent fetches of one id.
//! - Settle backend replies into cached instances and release waiters.
//!
//! # Invariants
//! - Within a session, every resolution of `(kind, id)` yields one instance.
//! - At most one `gets` per id is in flight; later requests attach to it.
//! - The session state is never borrowed while a backend call or a user
//!   continuation runs.
//! - Replies arriving after the session was dropped are ignored.
//! - Dropping a session detaches the references of its cached instances.

use crate::backend::{Backend, BackendResult};
use crate::error::{CoreError, CoreResult};
use crate::model::entity::Entity;
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::{Registry, Schema};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::sync::Arc;

pub mod completion;
pub(crate) mod linker;
pub mod ops;
mod state;

pub use completion::{Callback, Completion};
pub use ops::{EntityHandle, Fetched};

use completion::{Arrival, Waiter};
use linker::LinkedRecord;
use state::{ResolvePlan, SessionState, Ticket};

/// Produces sessions sharing one registry and one backend.
#[derive(Clone)]
pub struct Factory {
    registry: Arc<Registry>,
    backend: Rc<dyn Backend>,
}

impl Factory {
    /// Builds the registry from `schema`.
    ///
    /// # Errors
    /// - Returns `Configuration` when the schema is invalid or references
    ///   an undeclared type.
    pub fn new(schema: Schema, backend: Rc<dyn Backend>) -> CoreResult<Self> {
        let registry = Registry::new(schema)?;
        Ok(Self::with_registry(Arc::new(registry), backend))
    }

    pub fn with_registry(registry: Arc<Registry>, backend: Rc<dyn Backend>) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Opens a session with empty caches.
    pub fn session(&self) -> Session {
        let inner = Rc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            registry: Arc::clone(&self.registry),
            backend: Rc::clone(&self.backend),
            state: RefCell::new(SessionState::default()),
        });
        debug!("event=session_open module=session status=ok");
        Session { inner }
    }
}

/// One unit of work: an identity cache per entity type.
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    /// Handle for operations on one entity type.
    ///
    /// # Errors
    /// - Returns `Configuration` when `kind` is not declared.
    pub fn entity(&self, kind: &str) -> CoreResult<EntityHandle> {
        EntityHandle::new(Rc::clone(&self.inner), kind)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Declared entity type names.
    pub fn kinds(&self) -> Vec<String> {
        self.inner.registry.kinds().map(str::to_string).collect()
    }

    /// Drops every cached instance. Pending loads fail with `Evicted`.
    pub fn clear_caches(&self) {
        let kinds = self.inner.state.borrow().kinds();
        for kind in kinds {
            self.inner.clear_kind(&kind);
        }
    }

    /// Saves each entity; completes with all of them once every save
    /// succeeded, or with the first failure.
    pub fn save_all<F>(&self, entities: &[Entity], done: F)
    where
        F: FnOnce(CoreResult<Vec<Entity>>) + 'static,
    {
        if entities.is_empty() {
            return done(Ok(Vec::new()));
        }
        if let Some(foreign) = entities.iter().find(|entity| !entity.belongs_to(&self.inner)) {
            return done(Err(CoreError::Validation(format!(
                "{} instance belongs to another session",
                foreign.kind()
            ))));
        }

        let batch = Rc::new(RefCell::new(SaveBatch {
            remaining: entities.len(),
            saved: entities.to_vec(),
            done: Some(Box::new(done)),
        }));
        for entity in entities {
            let batch = Rc::clone(&batch);
            entity.save(move |result| SaveBatch::record(&batch, result));
        }
    }
}

struct SaveBatch {
    remaining: usize,
    saved: Vec<Entity>,
    done: Option<Callback<Vec<Entity>>>,
}

impl SaveBatch {
    fn record(batch: &Rc<RefCell<SaveBatch>>, result: CoreResult<Entity>) {
        let finish = {
            let mut state = batch.borrow_mut();
            match result {
                Err(err) => state.done.take().map(|done| (done, Err(err))),
                Ok(_) => {
                    state.remaining = state.remaining.saturating_sub(1);
                    if state.remaining == 0 {
                        let saved = std::mem::take(&mut state.saved);
                        state.done.take().map(|done| (done, Ok(saved)))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some((done, outcome)) = finish {
            done(outcome);
        }
    }
}

pub(crate) struct SessionInner {
    me: Weak<SessionInner>,
    registry: Arc<Registry>,
    backend: Rc<dyn Backend>,
    state: RefCell<SessionState>,
}

impl SessionInner {
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn backend(&self) -> &Rc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn weak(&self) -> Weak<SessionInner> {
        self.me.clone()
    }

    /// New unsaved instance owned by this session.
    pub(crate) fn new_entity(&self, kind: &str) -> Entity {
        Entity::new(kind, Arc::clone(&self.registry), self.weak(), None, false)
    }

    /// Cached instance for `id`, or a new registered placeholder.
    pub(crate) fn instance_for(&self, kind: &str, id: &EntityId) -> Entity {
        let registry = Arc::clone(&self.registry);
        let me = self.weak();
        self.state.borrow_mut().instance_for(kind, id, || {
            Entity::new(kind, registry, me, Some(id.clone()), true)
        })
    }

    pub(crate) fn link(&self, kind: &str, record: Record) -> LinkedRecord {
        linker::link(self, kind, record)
    }

    pub(crate) fn hydrate(&self, kind: &str, record: Record, complete: bool) -> Option<Entity> {
        linker::hydrate(self, kind, record, complete)
    }

    pub(crate) fn cached(&self, kind: &str, id: &EntityId) -> Option<Entity> {
        self.state.borrow().cached(kind, id)
    }

    pub(crate) fn is_pending(&self, kind: &str, id: &EntityId) -> bool {
        self.state.borrow().is_pending(kind, id)
    }

    pub(crate) fn cached_count(&self, kind: &str) -> usize {
        self.state.borrow().cached_count(kind)
    }

    /// Caches `entity` under its id unless another instance holds it.
    pub(crate) fn register(&self, kind: &str, id: &EntityId, entity: &Entity) {
        let cached = self.state.borrow_mut().register(kind, id, entity);
        if !cached.ptr_eq(entity) {
            warn!(
                "event=register module=session status=error kind={} id={} error_code=identity_conflict",
                kind, id
            );
        }
    }

    pub(crate) fn plan(
        &self,
        kind: &str,
        ids: &[EntityId],
        force_reload: bool,
        waiter: impl FnMut(&EntityId) -> Waiter,
    ) -> ResolvePlan {
        let registry = Arc::clone(&self.registry);
        let me = self.weak();
        let plan = self.state.borrow_mut().plan(
            kind,
            ids,
            force_reload,
            |id| Entity::new(kind, Arc::clone(&registry), me.clone(), Some(id.clone()), true),
            waiter,
        );
        debug!(
            "event=session_resolve module=session status=start kind={} requested={} ready={} fetch={} coalesced={} force_reload={}",
            kind,
            ids.len(),
            plan.ready.len(),
            plan.to_fetch.len(),
            plan.coalesced,
            force_reload
        );
        plan
    }

    /// Applies a `gets` reply for the ids fetched under `ticket`.
    ///
    /// Returned records are hydrated first; waiters run afterwards. Ids
    /// missing from the reply are evicted, and a failed reply evicts the
    /// whole batch. Ids whose pending entry was replaced by a newer fetch
    /// are left alone.
    pub(crate) fn settle_fetch(
        &self,
        kind: &str,
        batch: &[EntityId],
        ticket: Ticket,
        result: BackendResult<Vec<Record>>,
    ) {
        let owned = self.state.borrow().owned_by(kind, batch, ticket);
        if owned.len() != batch.len() {
            debug!(
                "event=session_settle module=session status=ok kind={} stale={}",
                kind,
                batch.len() - owned.len()
            );
        }

        let mut released: Vec<(Vec<Waiter>, Arrival)> = Vec::new();
        match result {
            Ok(records) => {
                let mut found = HashSet::new();
                for record in records {
                    let Some(id) = EntityId::from_record(&record) else {
                        continue;
                    };
                    if !owned.contains(&id) {
                        continue;
                    }
                    if self.hydrate(kind, record, true).is_some() {
                        found.insert(id);
                    }
                }

                let mut state = self.state.borrow_mut();
                for id in batch.iter().filter(|id| owned.contains(*id)) {
                    if found.contains(id) {
                        if let Some(waiters) = state.settle(kind, id, ticket) {
                            released.push((waiters, Arrival::Loaded));
                        }
                    } else {
                        let (_, waiters) = state.evict(kind, id);
                        released.push((waiters, Arrival::Missing));
                    }
                }
                debug!(
                    "event=session_settle module=session status=ok kind={} found={} missing={}",
                    kind,
                    found.len(),
                    owned.len() - found.len()
                );
            }
            Err(err) => {
                warn!(
                    "event=session_settle module=session status=error kind={} ids={} error={}",
                    kind,
                    owned.len(),
                    err
                );
                let err = CoreError::from(err);
                let mut state = self.state.borrow_mut();
                for id in batch.iter().filter(|id| owned.contains(*id)) {
                    let (_, waiters) = state.evict(kind, id);
                    released.push((waiters, Arrival::Failed(err.clone())));
                }
            }
        }

        release(released);
    }

    /// Merges `data` into every resident instance among `ids`.
    pub(crate) fn apply_update(&self, kind: &str, ids: &[EntityId], data: Record) {
        let linked = self.link(kind, data);
        let mut touched = 0;
        for id in ids {
            if let Some(entity) = self.cached(kind, id) {
                entity.merge(LinkedRecord {
                    id: None,
                    attrs: linked.attrs.clone(),
                });
                touched += 1;
            }
        }
        debug!(
            "event=session_apply_update module=session status=ok kind={} ids={} cached={}",
            kind,
            ids.len(),
            touched
        );
    }

    /// Evicts `ids`, failing their pending waiters with `Evicted`.
    pub(crate) fn evict(&self, kind: &str, ids: &[EntityId]) {
        let mut released = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            for id in ids {
                let (_, waiters) = state.evict(kind, id);
                released.push((waiters, evicted(kind, id)));
            }
        }
        debug!(
            "event=session_evict module=session status=ok kind={} ids={}",
            kind,
            ids.len()
        );
        release(released);
    }

    /// Empties one type's cache, failing pending waiters with `Evicted`.
    pub(crate) fn clear_kind(&self, kind: &str) {
        let pending = self.state.borrow_mut().clear(kind);
        info!(
            "event=session_clear module=session status=ok kind={} failed_pending={}",
            kind,
            pending.len()
        );
        release(
            pending
                .into_iter()
                .map(|(id, waiters)| (waiters, evicted(kind, &id)))
                .collect(),
        );
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let entities = self.state.get_mut().drain();
        for entity in &entities {
            entity.detach_references();
        }
        debug!(
            "event=session_close module=session status=ok detached={}",
            entities.len()
        );
    }
}

fn evicted(kind: &str, id: &EntityId) -> Arrival {
    Arrival::Failed(CoreError::Evicted {
        kind: kind.to_string(),
        id: id.clone(),
    })
}

fn release(released: Vec<(Vec<Waiter>, Arrival)>) {
    for (waiters, arrival) in released {
        for waiter in waiters {
            waiter(arrival.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Factory;
    use crate::backend::{Backend, MemoryBackend};
    use crate::error::CoreError;
    use crate::model::entity::Entity;
    use crate::schema::Schema;
    use crate::session::Completion;
    use serde_json::json;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn instance_of_undeclared_type_cannot_reach_its_handle() {
        let schema = Schema::from_value(json!({"Person": {"schema": {"properties": {}}}})).unwrap();
        let backend: Rc<dyn Backend> = Rc::new(MemoryBackend::new());
        let session = Factory::new(schema, backend).unwrap().session();
        let stray = Entity::new(
            "Dragon",
            Arc::clone(&session.inner.registry),
            session.inner.weak(),
            None,
            false,
        );

        let saved = Completion::new();
        stray.save(saved.callback());
        assert!(matches!(
            saved.take().unwrap(),
            Err(CoreError::Configuration(_))
        ));
    }
}
