//! Conversion between wire records and linked entity graphs.
//!
//! # Responsibility
//! - `link`: replace `{id}` objects and bare ids under reference properties
//!   with the session's instances, creating placeholders for unknown ids.
//! - `unlink`: flatten an instance back to its persistence form.
//!
//! # Invariants
//! - Linked attributes never hold raw ids.
//! - Unlinked records never hold nested entities and only carry declared
//!   properties.

use super::SessionInner;
use crate::model::entity::{Attr, Entity};
use crate::model::entity_id::EntityId;
use crate::model::Record;
use crate::schema::PropertyKind;
use log::{debug, warn};
use serde_json::{Map, Value};

/// Linked form of one record, ready to be merged into an instance.
///
/// `None` attributes clear the property.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkedRecord {
    pub id: Option<EntityId>,
    pub attrs: Vec<(String, Option<Attr>)>,
}

pub(crate) fn link(session: &SessionInner, kind: &str, record: Record) -> LinkedRecord {
    let registry = session.registry();
    let mut linked = LinkedRecord::default();

    for (name, value) in record {
        if name == "id" {
            linked.id = EntityId::from_json(&value);
            continue;
        }

        let attr = match registry.property_kind(kind, &name) {
            PropertyKind::Scalar => Some(Attr::Value(value)),
            PropertyKind::Reference(target) => {
                if value.is_null() {
                    None
                } else {
                    match identify(session, target, value) {
                        Some(entity) => Some(Attr::Ref(entity)),
                        None => {
                            warn!(
                                "event=link module=session status=error kind={} property={} error_code=reference_without_id",
                                kind, name
                            );
                            continue;
                        }
                    }
                }
            }
            PropertyKind::ReferenceList(target) => match value {
                Value::Null => None,
                Value::Array(items) => {
                    let total = items.len();
                    let entities = items
                        .into_iter()
                        .filter_map(|item| identify(session, target, item))
                        .collect::<Vec<_>>();
                    if entities.len() != total {
                        warn!(
                            "event=link module=session status=error kind={} property={} error_code=reference_without_id dropped={}",
                            kind,
                            name,
                            total - entities.len()
                        );
                    }
                    Some(Attr::Refs(entities))
                }
                _ => {
                    warn!(
                        "event=link module=session status=error kind={} property={} error_code=expected_list",
                        kind, name
                    );
                    continue;
                }
            },
        };
        linked.attrs.push((name, attr));
    }

    linked
}

/// Resolves one reference value to the session's instance for its id.
///
/// Extra fields carried by a nested object are merged into that instance,
/// which keeps its loading state.
fn identify(session: &SessionInner, target: &str, value: Value) -> Option<Entity> {
    let id = EntityId::from_reference(&value)?;
    let entity = session.instance_for(target, &id);

    if let Value::Object(fields) = value {
        let extra = fields
            .into_iter()
            .filter(|(name, _)| name != "id")
            .collect::<Map<String, Value>>();
        if !extra.is_empty() {
            let nested = link(session, target, extra);
            entity.merge(nested);
        }
    }

    Some(entity)
}

/// Links a full record of `kind` into its cached instance, creating one when
/// the id is new. Records without an id are skipped.
pub(crate) fn hydrate(
    session: &SessionInner,
    kind: &str,
    record: Record,
    complete: bool,
) -> Option<Entity> {
    let Some(id) = EntityId::from_record(&record) else {
        warn!(
            "event=hydrate module=session status=error kind={} error_code=record_without_id",
            kind
        );
        return None;
    };

    let entity = session.instance_for(kind, &id);
    let linked = link(session, kind, record);
    entity.merge(linked);
    if complete {
        entity.mark_loaded();
    }
    Some(entity)
}

pub(crate) fn unlink(entity: &Entity) -> Record {
    let registry = entity.registry();
    let mut record = Record::new();
    let Some(definition) = registry.definition(entity.kind()) else {
        return record;
    };

    entity.with_attrs(|attrs| {
        for name in definition.properties().keys() {
            if name == "id" {
                continue;
            }
            let Some(attr) = attrs.get(name) else {
                continue;
            };

            match (registry.property_kind(entity.kind(), name), attr) {
                (PropertyKind::Scalar, Attr::Value(value)) => {
                    record.insert(name.clone(), value.clone());
                }
                (PropertyKind::Reference(_), Attr::Ref(target)) => {
                    if let Some(id) = target.id() {
                        record.insert(name.clone(), reference(id));
                    }
                }
                (PropertyKind::ReferenceList(_), Attr::Refs(targets)) => {
                    let ids = targets
                        .iter()
                        .filter_map(Entity::id)
                        .map(reference)
                        .collect::<Vec<_>>();
                    if ids.len() != targets.len() {
                        debug!(
                            "event=unlink module=session status=ok kind={} property={} unsaved_targets={}",
                            entity.kind(),
                            name,
                            targets.len() - ids.len()
                        );
                    }
                    if !ids.is_empty() {
                        record.insert(name.clone(), Value::Array(ids));
                    }
                }
                _ => {}
            }
        }
    });

    record
}

fn reference(id: EntityId) -> Value {
    let mut object = Map::new();
    object.insert("id".to_string(), id.to_json());
    Value::Object(object)
}
