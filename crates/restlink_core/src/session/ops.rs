//! Entity operations of one type within one session.
//!
//! # Responsibility
//! - Expose `index`, `distinct`, `get`, `update`, `delete`, `insert` and
//!   `clear_all` over the backend, returning linked instances.
//! - Route every id resolution through the session cache.
//!
//! # Invariants
//! - Each operation calls its continuation exactly once, unless the session
//!   is dropped before the backend replies.
//! - Backend replies only hold a weak session reference.

use super::completion::{Arrival, Callback, Gather, GatherOutcome};
use super::state::Ticket;
use super::SessionInner;
use crate::backend::{BackendError, Query};
use crate::error::{CoreError, CoreResult};
use crate::model::entity::Entity;
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::TypeDefinition;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

/// Result of `get`: one slot when a single id was requested, otherwise one
/// slot per requested id in input order. `None` marks an id that does not
/// exist.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    One(Option<Entity>),
    Many(Vec<Option<Entity>>),
}

impl Fetched {
    /// Single result; for `Many`, the first slot.
    pub fn into_one(self) -> Option<Entity> {
        match self {
            Self::One(entity) => entity,
            Self::Many(entities) => entities.into_iter().next().flatten(),
        }
    }

    pub fn into_vec(self) -> Vec<Option<Entity>> {
        match self {
            Self::One(entity) => vec![entity],
            Self::Many(entities) => entities,
        }
    }
}

/// Operations on one entity type, bound to a session.
#[derive(Clone)]
pub struct EntityHandle {
    session: Rc<SessionInner>,
    definition: TypeDefinition,
}

impl EntityHandle {
    pub(crate) fn new(session: Rc<SessionInner>, kind: &str) -> CoreResult<Self> {
        let definition = session
            .registry()
            .definition(kind)
            .cloned()
            .ok_or_else(|| CoreError::Configuration(format!("unknown entity type `{kind}`")))?;
        Ok(Self {
            session,
            definition,
        })
    }

    pub fn kind(&self) -> &str {
        self.definition.name()
    }

    /// Path under which an HTTP exposer publishes this type.
    pub fn resource(&self) -> Option<&str> {
        self.definition.resource()
    }

    pub fn definition(&self) -> &TypeDefinition {
        &self.definition
    }

    /// New unsaved instance of this type.
    pub fn create(&self) -> Entity {
        self.session.new_entity(self.kind())
    }

    /// New unsaved instance linked from `record`.
    ///
    /// # Errors
    /// - Returns `Validation` when the record carries an `id`.
    pub fn create_from(&self, record: Record) -> CoreResult<Entity> {
        if record.contains_key("id") {
            return Err(CoreError::Validation(
                "new instances cannot carry an id; use `link` for stored records".to_string(),
            ));
        }
        let entity = self.create();
        entity.merge(self.session.link(self.kind(), record));
        Ok(entity)
    }

    /// Links a stored record into the session: the cached instance for its
    /// id is updated in place, or a new one is cached. Records without an id
    /// yield a new unsaved instance.
    pub fn link(&self, record: Record) -> Entity {
        let entity = match EntityId::from_record(&record) {
            Some(id) => self.session.instance_for(self.kind(), &id),
            None => self.create(),
        };
        entity.merge(self.session.link(self.kind(), record));
        entity
    }

    /// Cached instance for `id`, without touching the backend.
    pub fn cached(&self, id: &EntityId) -> Option<Entity> {
        self.session.cached(self.kind(), id)
    }

    /// Whether a fetch for `id` is in flight.
    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.session.is_pending(self.kind(), id)
    }

    pub fn cached_count(&self) -> usize {
        self.session.cached_count(self.kind())
    }

    /// Lists instances matching `query`. Returned records are complete, so
    /// their instances are marked loaded.
    pub fn index<F>(&self, query: Query, done: F)
    where
        F: FnOnce(CoreResult<Vec<Entity>>) + 'static,
    {
        let session = self.weak();
        let kind = self.kind().to_string();
        debug!(
            "event=entity_index module=session status=start kind={} filters={}",
            kind,
            query.len()
        );

        self.session.backend().index(
            &self.definition,
            &query,
            Box::new(move |result| {
                let Some(session) = upgrade(&session, &kind, "index") else {
                    return;
                };
                match result {
                    Ok(records) => {
                        let entities = records
                            .into_iter()
                            .filter_map(|record| session.hydrate(&kind, record, true))
                            .collect::<Vec<_>>();
                        debug!(
                            "event=entity_index module=session status=ok kind={} count={}",
                            kind,
                            entities.len()
                        );
                        done(Ok(entities));
                    }
                    Err(err) => {
                        warn!(
                            "event=entity_index module=session status=error kind={} error={}",
                            kind, err
                        );
                        done(Err(err.into()));
                    }
                }
            }),
        );
    }

    /// Distinct values of `key` over matching records.
    ///
    /// # Errors
    /// - Reports `Validation` for a blank key without calling the backend.
    pub fn distinct<F>(&self, key: &str, query: Query, done: F)
    where
        F: FnOnce(CoreResult<Vec<Value>>) + 'static,
    {
        if key.trim().is_empty() {
            return done(Err(CoreError::Validation(
                "distinct requires a non-empty key".to_string(),
            )));
        }

        self.session.backend().distinct(
            &self.definition,
            key,
            &query,
            Box::new(move |result| done(result.map_err(CoreError::from))),
        );
    }

    /// Resolves `ids` through the session cache.
    ///
    /// Resident, fully loaded instances are returned without a backend call
    /// unless `force_reload`. Ids already being fetched attach to the
    /// in-flight request. The continuation runs once every id is resolved.
    pub fn get<F>(&self, ids: &[EntityId], force_reload: bool, done: F)
    where
        F: FnOnce(CoreResult<Fetched>) + 'static,
    {
        if ids.is_empty() {
            return done(Ok(Fetched::Many(Vec::new())));
        }

        let kind = self.kind().to_string();
        let requested = ids.to_vec();
        let mut seen = HashSet::with_capacity(ids.len());
        let unique = ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect::<Vec<_>>();

        let gather = Gather::shared(unique.len());
        let plan = self
            .session
            .plan(&kind, &unique, force_reload, |id| Gather::waiter(&gather, id.clone()));

        let instances = plan.instances;
        Gather::on_finish(&gather, move |outcome: GatherOutcome| {
            if let Some(err) = outcome.failure {
                return done(Err(err));
            }
            let mut found = requested
                .iter()
                .map(|id| {
                    if outcome.missing.contains(id) {
                        None
                    } else {
                        instances.get(id).cloned()
                    }
                })
                .collect::<Vec<_>>();
            if found.len() == 1 {
                done(Ok(Fetched::One(found.pop().flatten())));
            } else {
                done(Ok(Fetched::Many(found)));
            }
        });

        if !plan.to_fetch.is_empty() {
            self.fetch(plan.to_fetch, plan.ticket);
        }
        for id in plan.ready {
            Gather::arrive(&gather, id, Arrival::Loaded);
        }
    }

    /// Single-id `get`.
    pub fn get_one<F>(&self, id: EntityId, force_reload: bool, done: F)
    where
        F: FnOnce(CoreResult<Option<Entity>>) + 'static,
    {
        self.get(&[id], force_reload, move |result| {
            done(result.map(Fetched::into_one));
        });
    }

    /// Writes `data` to every record in `ids` with one backend call.
    ///
    /// With `confirm`, cached instances change only after the backend
    /// acknowledged the write. Without it, cached instances change at once
    /// and the write is not awaited; a failed write leaves them ahead of the
    /// store.
    pub fn update(&self, ids: &[EntityId], data: Record, confirm: Option<Callback<()>>) {
        if data.contains_key("id") {
            let err = CoreError::Validation("update data cannot change `id`".to_string());
            match confirm {
                Some(confirm) => confirm(Err(err)),
                None => warn!(
                    "event=entity_update module=session status=error kind={} error={}",
                    self.kind(),
                    err
                ),
            }
            return;
        }
        if ids.is_empty() {
            if let Some(confirm) = confirm {
                confirm(Ok(()));
            }
            return;
        }

        let kind = self.kind().to_string();
        let Some(confirm) = confirm else {
            debug!(
                "event=entity_update module=session status=start kind={} ids={} confirmed=false",
                kind,
                ids.len()
            );
            self.session
                .backend()
                .update(&self.definition, ids, &data, None);
            self.session.apply_update(&kind, ids, data);
            return;
        };

        debug!(
            "event=entity_update module=session status=start kind={} ids={} confirmed=true",
            kind,
            ids.len()
        );
        let session = self.weak();
        let targets = ids.to_vec();
        let payload = data.clone();
        self.session.backend().update(
            &self.definition,
            ids,
            &data,
            Some(Box::new(move |result| {
                let Some(session) = upgrade(&session, &kind, "update") else {
                    return;
                };
                match result {
                    Ok(()) => {
                        session.apply_update(&kind, &targets, payload);
                        confirm(Ok(()));
                    }
                    Err(err) => {
                        warn!(
                            "event=entity_update module=session status=error kind={} error={}",
                            kind, err
                        );
                        confirm(Err(err.into()));
                    }
                }
            })),
        );
    }

    /// Deletes `ids` from the backend, then evicts them. Loads still pending
    /// for those ids fail with `Evicted`.
    pub fn delete<F>(&self, ids: &[EntityId], done: F)
    where
        F: FnOnce(CoreResult<()>) + 'static,
    {
        let session = self.weak();
        let kind = self.kind().to_string();
        let targets = ids.to_vec();
        self.session.backend().delete(
            &self.definition,
            ids,
            Box::new(move |result| {
                let Some(session) = upgrade(&session, &kind, "delete") else {
                    return;
                };
                match result {
                    Ok(()) => {
                        session.evict(&kind, &targets);
                        done(Ok(()));
                    }
                    Err(err) => {
                        warn!(
                            "event=entity_delete module=session status=error kind={} error={}",
                            kind, err
                        );
                        done(Err(err.into()));
                    }
                }
            }),
        );
    }

    /// Stores a new instance. On success the assigned id and server fields
    /// are merged into `entity` itself, which joins the cache.
    ///
    /// # Errors
    /// - `Validation` when `entity` already has an id, is of another type,
    ///   or belongs to another session.
    pub fn insert<F>(&self, entity: &Entity, done: F)
    where
        F: FnOnce(CoreResult<Entity>) + 'static,
    {
        if let Err(err) = self.check_insertable(entity) {
            return done(Err(err));
        }

        let session = self.weak();
        let kind = self.kind().to_string();
        let inserted = entity.clone();
        self.session.backend().insert(
            &self.definition,
            entity.unlink(),
            Box::new(move |result| {
                let Some(session) = upgrade(&session, &kind, "insert") else {
                    return;
                };
                let stored = match result {
                    Ok(stored) => stored,
                    Err(err) => {
                        warn!(
                            "event=entity_insert module=session status=error kind={} error={}",
                            kind, err
                        );
                        return done(Err(err.into()));
                    }
                };
                let Some(id) = EntityId::from_record(&stored) else {
                    return done(Err(CoreError::from(BackendError::InvalidRecord(
                        "insert reply carries no id".to_string(),
                    ))));
                };

                inserted.merge(session.link(&kind, stored));
                inserted.mark_loaded();
                session.register(&kind, &id, &inserted);
                debug!(
                    "event=entity_insert module=session status=ok kind={} id={}",
                    kind, id
                );
                done(Ok(inserted));
            }),
        );
    }

    /// Deletes every record of this type. The local cache is cleared first
    /// and its pending loads fail with `Evicted`.
    pub fn clear_all<F>(&self, done: F)
    where
        F: FnOnce(CoreResult<()>) + 'static,
    {
        self.session.clear_kind(self.kind());
        self.session.backend().clear_all(
            &self.definition,
            Box::new(move |result| done(result.map_err(CoreError::from))),
        );
    }

    /// Drops this type's cached instances without touching the backend.
    pub fn clear_cache(&self) {
        self.session.clear_kind(self.kind());
    }

    pub(crate) fn adopt(&self, entity: &Entity) {
        if let Some(id) = entity.id() {
            self.session.register(self.kind(), &id, entity);
        }
    }

    fn check_insertable(&self, entity: &Entity) -> CoreResult<()> {
        if entity.kind() != self.kind() {
            return Err(CoreError::Validation(format!(
                "cannot insert {} through the {} handle",
                entity.kind(),
                self.kind()
            )));
        }
        if !entity.belongs_to(&self.session) {
            return Err(CoreError::Validation(format!(
                "{} instance belongs to another session",
                entity.kind()
            )));
        }
        if let Some(id) = entity.id() {
            return Err(CoreError::Validation(format!(
                "{} {id} already has an id; use update",
                entity.kind()
            )));
        }
        Ok(())
    }

    fn fetch(&self, ids: Vec<EntityId>, ticket: Ticket) {
        debug!(
            "event=entity_fetch module=session status=start kind={} ids={}",
            self.kind(),
            ids.len()
        );
        let session = self.weak();
        let kind = self.kind().to_string();
        let batch = ids.clone();
        self.session.backend().gets(
            &self.definition,
            &ids,
            Box::new(move |result| {
                if let Some(session) = upgrade(&session, &kind, "gets") {
                    session.settle_fetch(&kind, &batch, ticket, result);
                }
            }),
        );
    }

    fn weak(&self) -> Weak<SessionInner> {
        Rc::downgrade(&self.session)
    }
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("kind", &self.kind())
            .field("cached", &self.cached_count())
            .finish()
    }
}

fn upgrade(session: &Weak<SessionInner>, kind: &str, operation: &str) -> Option<Rc<SessionInner>> {
    let upgraded = session.upgrade();
    if upgraded.is_none() {
        debug!(
            "event=reply_dropped module=session status=ok kind={} op={} reason=session_closed",
            kind, operation
        );
    }
    upgraded
}
