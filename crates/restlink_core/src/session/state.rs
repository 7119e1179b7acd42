//! Identity cache and pending-fetch table of one session.
//!
//! # Invariants
//! - At most one entry per `(kind, id)`; every resolution returns it.
//! - A pending entry belongs to the fetch that created it, identified by its
//!   ticket. Only that fetch may settle it.
//! - Nothing here calls user code; waiters are handed back to the caller to
//!   run after the session borrow is released.

use super::completion::Waiter;
use crate::model::entity::Entity;
use crate::model::entity_id::EntityId;
use std::collections::{HashMap, HashSet};

pub(crate) type Ticket = u64;

struct PendingFetch {
    ticket: Ticket,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct TypeCache {
    entries: HashMap<EntityId, Entity>,
    pending: HashMap<EntityId, PendingFetch>,
}

/// Outcome of planning one `get` call.
pub(crate) struct ResolvePlan {
    /// Instance per requested id (cached, or a fresh placeholder).
    pub instances: HashMap<EntityId, Entity>,
    /// Resident and fully loaded; nothing to wait for.
    pub ready: Vec<EntityId>,
    /// Ids this call must fetch under `ticket`.
    pub to_fetch: Vec<EntityId>,
    /// Ids already being fetched by an earlier call.
    pub coalesced: usize,
    pub ticket: Ticket,
}

#[derive(Default)]
pub(crate) struct SessionState {
    types: HashMap<String, TypeCache>,
    next_ticket: Ticket,
}

impl SessionState {
    pub(crate) fn cached(&self, kind: &str, id: &EntityId) -> Option<Entity> {
        self.types.get(kind)?.entries.get(id).cloned()
    }

    pub(crate) fn is_pending(&self, kind: &str, id: &EntityId) -> bool {
        self.types
            .get(kind)
            .is_some_and(|cache| cache.pending.contains_key(id))
    }

    pub(crate) fn cached_count(&self, kind: &str) -> usize {
        self.types.get(kind).map_or(0, |cache| cache.entries.len())
    }

    /// Returns the cached instance for `id`, registering `make()` when absent.
    pub(crate) fn instance_for(
        &mut self,
        kind: &str,
        id: &EntityId,
        make: impl FnOnce() -> Entity,
    ) -> Entity {
        self.cache_mut(kind)
            .entries
            .entry(id.clone())
            .or_insert_with(make)
            .clone()
    }

    /// Registers `entity` under `id` unless another instance is already
    /// there. Returns the instance that ends up cached.
    pub(crate) fn register(&mut self, kind: &str, id: &EntityId, entity: &Entity) -> Entity {
        self.instance_for(kind, id, || entity.clone())
    }

    /// Classifies `ids` (already de-duplicated), creates placeholders for
    /// absent ones, opens pending entries for the ones to fetch, and parks one
    /// waiter per non-ready id.
    pub(crate) fn plan(
        &mut self,
        kind: &str,
        ids: &[EntityId],
        force_reload: bool,
        mut placeholder: impl FnMut(&EntityId) -> Entity,
        mut waiter: impl FnMut(&EntityId) -> Waiter,
    ) -> ResolvePlan {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let cache = self.cache_mut(kind);

        let mut plan = ResolvePlan {
            instances: HashMap::with_capacity(ids.len()),
            ready: Vec::new(),
            to_fetch: Vec::new(),
            coalesced: 0,
            ticket,
        };

        for id in ids {
            let entity = cache
                .entries
                .entry(id.clone())
                .or_insert_with(|| placeholder(id))
                .clone();

            if let Some(pending) = cache.pending.get_mut(id) {
                pending.waiters.push(waiter(id));
                plan.coalesced += 1;
            } else if !force_reload && !entity.is_partially_loaded() {
                plan.ready.push(id.clone());
            } else {
                cache.pending.insert(
                    id.clone(),
                    PendingFetch {
                        ticket,
                        waiters: vec![waiter(id)],
                    },
                );
                plan.to_fetch.push(id.clone());
            }
            plan.instances.insert(id.clone(), entity);
        }

        plan
    }

    /// Ids of `batch` whose pending entry still belongs to `ticket`.
    pub(crate) fn owned_by(&self, kind: &str, batch: &[EntityId], ticket: Ticket) -> HashSet<EntityId> {
        let Some(cache) = self.types.get(kind) else {
            return HashSet::new();
        };
        batch
            .iter()
            .filter(|id| {
                cache
                    .pending
                    .get(*id)
                    .is_some_and(|pending| pending.ticket == ticket)
            })
            .cloned()
            .collect()
    }

    /// Closes the pending entry of `id` if `ticket` owns it; the entry stays
    /// cached.
    pub(crate) fn settle(&mut self, kind: &str, id: &EntityId, ticket: Ticket) -> Option<Vec<Waiter>> {
        let cache = self.types.get_mut(kind)?;
        if cache.pending.get(id)?.ticket != ticket {
            return None;
        }
        cache.pending.remove(id).map(|pending| pending.waiters)
    }

    /// Removes `id` from cache and pending table, returning parked waiters.
    pub(crate) fn evict(&mut self, kind: &str, id: &EntityId) -> (Option<Entity>, Vec<Waiter>) {
        let Some(cache) = self.types.get_mut(kind) else {
            return (None, Vec::new());
        };
        let entity = cache.entries.remove(id);
        let waiters = cache
            .pending
            .remove(id)
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        (entity, waiters)
    }

    /// Empties one type's cache, returning the waiters of every pending id.
    pub(crate) fn clear(&mut self, kind: &str) -> Vec<(EntityId, Vec<Waiter>)> {
        match self.types.remove(kind) {
            Some(cache) => cache
                .pending
                .into_iter()
                .map(|(id, pending)| (id, pending.waiters))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Empties every cache and pending table, returning the cached instances.
    pub(crate) fn drain(&mut self) -> Vec<Entity> {
        self.types
            .drain()
            .flat_map(|(_, cache)| cache.entries.into_values())
            .collect()
    }

    pub(crate) fn kinds(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    fn cache_mut(&mut self, kind: &str) -> &mut TypeCache {
        self.types.entry(kind.to_string()).or_default()
    }
}
