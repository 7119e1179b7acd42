//! Live entity instances.
//!
//! # Responsibility
//! - Hold the mutable attribute state of one entity inside its session.
//! - Offer instance-level persistence shortcuts (`save`, `refresh`, ...).
//!
//! # Invariants
//! - Clones share one underlying instance; equality is instance identity.
//! - Reference attributes hold `Entity` values, never raw ids.
//! - An instance belongs to exactly one session for its whole lifetime.

use super::entity_id::EntityId;
use super::Record;
use crate::error::{CoreError, CoreResult};
use crate::schema::{PropertyKind, Registry};
use crate::session::linker::{self, LinkedRecord};
use crate::session::{Callback, EntityHandle, SessionInner};
use log::warn;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// One attribute value of a linked entity.
#[derive(Clone, PartialEq)]
pub enum Attr {
    Value(Value),
    Ref(Entity),
    Refs(Vec<Entity>),
}

impl Debug for Attr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Ref(entity) => write!(f, "&{}", entity.label()),
            Self::Refs(entities) => f
                .debug_list()
                .entries(entities.iter().map(|entity| format!("&{}", entity.label())))
                .finish(),
        }
    }
}

impl From<Value> for Attr {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Entity> for Attr {
    fn from(value: Entity) -> Self {
        Self::Ref(value)
    }
}

impl From<Vec<Entity>> for Attr {
    fn from(value: Vec<Entity>) -> Self {
        Self::Refs(value)
    }
}

/// Handle to one entity instance.
#[derive(Clone)]
pub struct Entity {
    cell: Rc<EntityCell>,
}

/// Non-owning handle to an entity instance.
#[derive(Clone)]
pub struct WeakEntity {
    cell: Weak<EntityCell>,
}

impl WeakEntity {
    pub fn upgrade(&self) -> Option<Entity> {
        self.cell.upgrade().map(|cell| Entity { cell })
    }
}

struct EntityCell {
    kind: String,
    registry: Arc<Registry>,
    session: Weak<SessionInner>,
    state: RefCell<EntityState>,
}

#[derive(Default)]
struct EntityState {
    id: Option<EntityId>,
    attrs: BTreeMap<String, Attr>,
    partially_loaded: bool,
}

impl Entity {
    pub(crate) fn new(
        kind: &str,
        registry: Arc<Registry>,
        session: Weak<SessionInner>,
        id: Option<EntityId>,
        partially_loaded: bool,
    ) -> Self {
        Self {
            cell: Rc::new(EntityCell {
                kind: kind.to_string(),
                registry,
                session,
                state: RefCell::new(EntityState {
                    id,
                    attrs: BTreeMap::new(),
                    partially_loaded,
                }),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.cell.kind
    }

    pub fn id(&self) -> Option<EntityId> {
        self.cell.state.borrow().id.clone()
    }

    /// True for placeholders materialized from a reference and not yet
    /// hydrated with backend data.
    pub fn is_partially_loaded(&self) -> bool {
        self.cell.state.borrow().partially_loaded
    }

    /// Returns whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn get(&self, name: &str) -> Option<Attr> {
        self.cell.state.borrow().attrs.get(name).cloned()
    }

    /// Returns a scalar attribute.
    pub fn value(&self, name: &str) -> Option<Value> {
        match self.cell.state.borrow().attrs.get(name) {
            Some(Attr::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns a scalar attribute as text.
    pub fn text(&self, name: &str) -> Option<String> {
        self.value(name)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    pub fn reference(&self, name: &str) -> Option<Entity> {
        match self.cell.state.borrow().attrs.get(name) {
            Some(Attr::Ref(entity)) => Some(entity.clone()),
            _ => None,
        }
    }

    pub fn references(&self, name: &str) -> Option<Vec<Entity>> {
        match self.cell.state.borrow().attrs.get(name) {
            Some(Attr::Refs(entities)) => Some(entities.clone()),
            _ => None,
        }
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.cell.state.borrow().attrs.keys().cloned().collect()
    }

    /// Sets an attribute from a plain value.
    ///
    /// For reference properties the value is a bare id or an `{id}` object
    /// (a list of them for reference lists) and is linked to the session's
    /// instance for that id, creating a placeholder when unknown.
    ///
    /// # Errors
    /// - `Validation` for `id`, which only the backend assigns.
    /// - `SessionClosed` when a reference must be linked after the session
    ///   was dropped.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> CoreResult<()> {
        if name == "id" {
            return Err(CoreError::Validation(
                "`id` is assigned by the backend".to_string(),
            ));
        }

        let value = value.into();
        match self.property_kind(name) {
            PropertyKind::Scalar => {
                self.cell
                    .state
                    .borrow_mut()
                    .attrs
                    .insert(name.to_string(), Attr::Value(value));
            }
            PropertyKind::Reference(_) | PropertyKind::ReferenceList(_) => {
                let session = self.session()?;
                let mut record = Record::new();
                record.insert(name.to_string(), value);
                let linked = session.link(self.kind(), record);
                self.merge(linked);
            }
        }
        Ok(())
    }

    /// Points a single-reference property at `target`, or clears it.
    pub fn set_reference(&self, name: &str, target: Option<&Entity>) -> CoreResult<()> {
        let PropertyKind::Reference(expected) = self.property_kind(name) else {
            return Err(CoreError::Validation(format!(
                "{}.{name} is not a reference property",
                self.kind()
            )));
        };

        let mut state = self.cell.state.borrow_mut();
        match target {
            Some(target) => {
                self.check_target(name, expected, target)?;
                state.attrs.insert(name.to_string(), Attr::Ref(target.clone()));
            }
            None => {
                state.attrs.remove(name);
            }
        }
        Ok(())
    }

    /// Replaces a reference-list property.
    pub fn set_references(&self, name: &str, targets: &[Entity]) -> CoreResult<()> {
        let PropertyKind::ReferenceList(expected) = self.property_kind(name) else {
            return Err(CoreError::Validation(format!(
                "{}.{name} is not a reference list property",
                self.kind()
            )));
        };
        for target in targets {
            self.check_target(name, expected, target)?;
        }

        self.cell
            .state
            .borrow_mut()
            .attrs
            .insert(name.to_string(), Attr::Refs(targets.to_vec()));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Attr> {
        self.cell.state.borrow_mut().attrs.remove(name)
    }

    /// Flattened persistence form: declared properties only, references as
    /// `{id}`, no `id` of its own.
    pub fn unlink(&self) -> Record {
        linker::unlink(self)
    }

    /// Wire form exposed to transport layers: `unlink` plus the id.
    pub fn to_wire_form(&self) -> Record {
        let mut record = self.unlink();
        if let Some(id) = self.id() {
            record.insert("id".to_string(), id.to_json());
        }
        record
    }

    /// Persists the instance: `update` when it has an id, `insert` otherwise.
    pub fn save<F>(&self, done: F)
    where
        F: FnOnce(CoreResult<Entity>) + 'static,
    {
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return done(Err(err)),
        };

        match self.id() {
            Some(id) => {
                let saved = self.clone();
                handle.update(
                    &[id],
                    self.unlink(),
                    Some(Box::new(move |result| done(result.map(|()| saved)))),
                );
            }
            None => handle.insert(self, done),
        }
    }

    /// Reloads the instance from the backend, bypassing the cache.
    ///
    /// Completes with the session's cached instance for the id. When another
    /// instance took over that id (for example after `clear_cache` and a new
    /// `get`), the reload lands on that one and is copied into `self` too.
    pub fn refresh<F>(&self, done: F)
    where
        F: FnOnce(CoreResult<Entity>) + 'static,
    {
        let (handle, id) = match self.handle_and_id() {
            Ok(pair) => pair,
            Err(err) => return done(Err(err)),
        };

        // An evicted instance rejoins the cache so the reload lands on it.
        handle.adopt(self);
        let kind = self.kind().to_string();
        let target = self.clone();
        handle.get_one(id.clone(), true, move |result| {
            done(match result {
                Ok(Some(entity)) => {
                    if !entity.ptr_eq(&target) {
                        target.absorb(&entity);
                    }
                    Ok(entity)
                }
                Ok(None) => Err(CoreError::NotFound { kind, id }),
                Err(err) => Err(err),
            });
        });
    }

    /// Deletes the instance from the backend and evicts it from the cache.
    pub fn delete<F>(&self, done: F)
    where
        F: FnOnce(CoreResult<()>) + 'static,
    {
        match self.handle_and_id() {
            Ok((handle, id)) => handle.delete(&[id], done),
            Err(err) => done(Err(err)),
        }
    }

    /// Writes `data` for this instance; see `EntityHandle::update`.
    pub fn update(&self, data: Record, confirm: Option<Callback<()>>) {
        match self.handle_and_id() {
            Ok((handle, id)) => handle.update(&[id], data, confirm),
            Err(err) => {
                if let Some(confirm) = confirm {
                    confirm(Err(err));
                }
            }
        }
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.cell.registry
    }

    pub(crate) fn belongs_to(&self, session: &Rc<SessionInner>) -> bool {
        std::ptr::eq(self.cell.session.as_ptr(), Rc::as_ptr(session))
    }

    pub(crate) fn same_session(&self, other: &Entity) -> bool {
        Weak::ptr_eq(&self.cell.session, &other.cell.session)
    }

    /// Applies a linked record in place. An already assigned id is kept.
    pub(crate) fn merge(&self, linked: LinkedRecord) {
        let mut state = self.cell.state.borrow_mut();
        if let Some(id) = linked.id {
            match &state.id {
                None => state.id = Some(id),
                Some(current) if *current != id => warn!(
                    "event=entity_merge module=model status=error kind={} id={} error_code=id_mismatch incoming={}",
                    self.cell.kind, current, id
                ),
                Some(_) => {}
            }
        }
        for (name, attr) in linked.attrs {
            match attr {
                Some(attr) => {
                    state.attrs.insert(name, attr);
                }
                None => {
                    state.attrs.remove(&name);
                }
            }
        }
    }

    /// Copies the loaded state of `source`, another instance for the same id.
    fn absorb(&self, source: &Entity) {
        let (attrs, partially_loaded) = {
            let source = source.cell.state.borrow();
            (source.attrs.clone(), source.partially_loaded)
        };
        let mut state = self.cell.state.borrow_mut();
        state.attrs = attrs;
        state.partially_loaded = partially_loaded;
    }

    /// Drops reference attributes so instances pointing at each other can be
    /// freed once their session is gone.
    pub(crate) fn detach_references(&self) {
        if let Ok(mut state) = self.cell.state.try_borrow_mut() {
            state.attrs.retain(|_, attr| matches!(attr, Attr::Value(_)));
        }
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity {
            cell: Rc::downgrade(&self.cell),
        }
    }

    pub(crate) fn mark_loaded(&self) {
        self.cell.state.borrow_mut().partially_loaded = false;
    }

    /// Visits declared attributes while the state is borrowed.
    pub(crate) fn with_attrs<R>(&self, visit: impl FnOnce(&BTreeMap<String, Attr>) -> R) -> R {
        visit(&self.cell.state.borrow().attrs)
    }

    fn property_kind(&self, name: &str) -> PropertyKind<'_> {
        self.cell.registry.property_kind(&self.cell.kind, name)
    }

    fn check_target(&self, name: &str, expected: &str, target: &Entity) -> CoreResult<()> {
        if target.kind() != expected {
            return Err(CoreError::Validation(format!(
                "{}.{name} expects {expected}, got {}",
                self.kind(),
                target.kind()
            )));
        }
        if !self.same_session(target) {
            return Err(CoreError::Validation(format!(
                "{}.{name} cannot reference an instance owned by another session",
                self.kind()
            )));
        }
        Ok(())
    }

    fn session(&self) -> CoreResult<Rc<SessionInner>> {
        self.cell.session.upgrade().ok_or(CoreError::SessionClosed)
    }

    fn handle(&self) -> CoreResult<EntityHandle> {
        EntityHandle::new(self.session()?, self.kind())
    }

    fn handle_and_id(&self) -> CoreResult<(EntityHandle, EntityId)> {
        let id = self.id().ok_or_else(|| {
            CoreError::Validation(format!("{} instance has no id yet", self.kind()))
        })?;
        Ok((self.handle()?, id))
    }

    fn label(&self) -> String {
        match self.cell.state.try_borrow() {
            Ok(state) => match &state.id {
                Some(id) => format!("{}#{id}", self.cell.kind),
                None => format!("{}#new", self.cell.kind),
            },
            Err(_) => format!("{}#busy", self.cell.kind),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Entity {}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let Ok(state) = self.cell.state.try_borrow() else {
            return write!(f, "Entity({})", self.label());
        };
        f.debug_struct("Entity")
            .field("kind", &self.cell.kind)
            .field("id", &state.id)
            .field("partially_loaded", &state.partially_loaded)
            .field("attrs", &state.attrs)
            .finish()
    }
}
