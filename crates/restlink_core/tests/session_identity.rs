use restlink_core::{
    Backend, Completion, CoreError, Entity, EntityId, Factory, MemoryBackend, Record, Schema,
    Session,
};
use serde_json::{json, Value};
use std::rc::Rc;

fn schema() -> Schema {
    Schema::from_value(json!({
        "Person": {
            "resource": "/people",
            "schema": {
                "id": "Person",
                "description": "Someone",
                "properties": {
                    "id": {"type": "string"},
                    "firstname": {"type": "string"},
                    "friends": {"type": "array", "items": {"$ref": "Person"}},
                    "mother": {"$ref": "Person"}
                }
            }
        },
        "Animal": {
            "resource": "/animals",
            "schema": {
                "id": "Animal",
                "properties": {
                    "name": {"type": "string"},
                    "owner": {"$ref": "Person"}
                }
            }
        }
    }))
    .unwrap()
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("fixture must be an object"),
    }
}

fn open(backend: &Rc<MemoryBackend>) -> Session {
    let shared: Rc<dyn Backend> = backend.clone();
    Factory::new(schema(), shared).unwrap().session()
}

fn finished<T: 'static>(completion: &Completion<T>) -> T {
    completion
        .take()
        .expect("operation should have completed")
        .unwrap()
}

#[test]
fn repeated_get_returns_the_cached_instance() {
    let backend = Rc::new(MemoryBackend::new());
    let id = backend.seed("Person", record(json!({"id": "p1", "firstname": "Ada"})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let first = Completion::new();
    people.get_one(id.clone(), false, first.callback());
    let second = Completion::new();
    people.get_one(id.clone(), false, second.callback());

    let first = finished(&first).unwrap();
    let second = finished(&second).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(first.text("firstname").as_deref(), Some("Ada"));
    assert_eq!(backend.calls("gets"), 1);
}

#[test]
fn index_and_get_share_instances() {
    let backend = Rc::new(MemoryBackend::new());
    let id = backend.seed("Person", record(json!({"firstname": "Grace"})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let listed = Completion::new();
    people.index(Record::new(), listed.callback());
    let listed = finished(&listed);
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_partially_loaded());

    let fetched = Completion::new();
    people.get_one(id, false, fetched.callback());
    assert!(finished(&fetched).unwrap().ptr_eq(&listed[0]));
    assert_eq!(backend.calls("gets"), 0);
}

#[test]
fn references_link_to_placeholders_that_hydrate_in_place() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Person", record(json!({"id": "rhea", "firstname": "Rhea"})));
    backend.seed(
        "Person",
        record(json!({"id": "zeus", "firstname": "Zeus", "mother": {"id": "rhea"}})),
    );
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let zeus = Completion::new();
    people.index(record(json!({"firstname": "Zeus"})), zeus.callback());
    let zeus = finished(&zeus);
    assert_eq!(zeus.len(), 1);

    let mother = zeus[0].reference("mother").unwrap();
    assert!(mother.is_partially_loaded());
    assert_eq!(mother.id(), Some(EntityId::from("rhea")));
    assert_eq!(mother.text("firstname"), None);
    assert!(people.cached(&EntityId::from("rhea")).unwrap().ptr_eq(&mother));

    let rhea = Completion::new();
    people.index(record(json!({"firstname": "Rhea"})), rhea.callback());
    let rhea = finished(&rhea);
    assert!(rhea[0].ptr_eq(&mother));
    assert!(!mother.is_partially_loaded());
    assert_eq!(mother.text("firstname").as_deref(), Some("Rhea"));
}

#[test]
fn get_loads_placeholders_but_not_loaded_instances() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Person", record(json!({"id": "m", "firstname": "Mother"})));
    backend.seed(
        "Person",
        record(json!({"id": "c", "firstname": "Child", "mother": "m"})),
    );
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let child = Completion::new();
    people.get_one(EntityId::from("c"), false, child.callback());
    let child = finished(&child).unwrap();
    let mother = child.reference("mother").unwrap();
    assert!(mother.is_partially_loaded());

    let loaded = Completion::new();
    people.get_one(EntityId::from("m"), false, loaded.callback());
    assert!(finished(&loaded).unwrap().ptr_eq(&mother));
    assert!(!mother.is_partially_loaded());
    assert_eq!(backend.calls("gets"), 2);

    let again = Completion::new();
    people.get_one(EntityId::from("m"), false, again.callback());
    finished(&again);
    assert_eq!(backend.calls("gets"), 2);
}

#[test]
fn get_many_keeps_input_order_and_marks_missing_ids() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Person", record(json!({"id": 1, "firstname": "One"})));
    backend.seed("Person", record(json!({"id": 2, "firstname": "Two"})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let fetched = Completion::new();
    people.get(
        &[
            EntityId::from(2),
            EntityId::from(9),
            EntityId::from(1),
            EntityId::from(2),
        ],
        false,
        fetched.callback(),
    );
    let slots = finished(&fetched).into_vec();

    assert_eq!(slots.len(), 4);
    assert_eq!(slots[0].as_ref().unwrap().text("firstname").as_deref(), Some("Two"));
    assert!(slots[1].is_none());
    assert_eq!(slots[2].as_ref().unwrap().text("firstname").as_deref(), Some("One"));
    assert!(slots[0].as_ref().unwrap().ptr_eq(slots[3].as_ref().unwrap()));
    assert_eq!(backend.calls("gets"), 1);
}

#[test]
fn missing_id_is_evicted_and_refetched() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let ghost = EntityId::from("ghost");

    let first = Completion::new();
    people.get_one(ghost.clone(), false, first.callback());
    assert!(finished(&first).is_none());
    assert!(people.cached(&ghost).is_none());

    backend.seed("Person", record(json!({"id": "ghost", "firstname": "Casper"})));
    let second = Completion::new();
    people.get_one(ghost.clone(), false, second.callback());
    let found = finished(&second).unwrap();
    assert_eq!(found.text("firstname").as_deref(), Some("Casper"));
    assert_eq!(backend.calls("gets"), 2);
}

#[test]
fn unlink_then_link_restores_the_same_references() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Person", record(json!({"id": "a", "firstname": "A"})));
    backend.seed("Person", record(json!({"id": "b", "firstname": "B"})));
    backend.seed(
        "Person",
        record(json!({
            "id": "c",
            "firstname": "C",
            "mother": {"id": "a"},
            "friends": [{"id": "a"}, {"id": "b"}]
        })),
    );
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let listed = Completion::new();
    people.index(Record::new(), listed.callback());
    finished(&listed);
    let c = people.cached(&EntityId::from("c")).unwrap();

    let mut flat = c.unlink();
    assert_eq!(flat.get("mother"), Some(&json!({"id": "a"})));
    assert_eq!(flat.get("friends"), Some(&json!([{"id": "a"}, {"id": "b"}])));
    assert!(!flat.contains_key("id"));

    flat.insert("id".to_string(), json!("c"));
    let relinked = people.link(flat);
    assert!(relinked.ptr_eq(&c));
    assert!(relinked
        .reference("mother")
        .unwrap()
        .ptr_eq(&people.cached(&EntityId::from("a")).unwrap()));
    let friends = relinked.references("friends").unwrap();
    assert_eq!(friends.len(), 2);
    assert!(friends[1].ptr_eq(&people.cached(&EntityId::from("b")).unwrap()));
}

#[test]
fn unlink_keeps_only_declared_properties() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let person = people
        .create_from(record(json!({"firstname": "Lin", "nickname": "L", "friends": []})))
        .unwrap();
    assert_eq!(person.text("nickname").as_deref(), Some("L"));
    assert_eq!(person.references("friends"), Some(Vec::new()));

    assert_eq!(person.unlink(), record(json!({"firstname": "Lin"})));
    assert_eq!(person.to_wire_form(), record(json!({"firstname": "Lin"})));
}

#[test]
fn setting_a_reference_by_id_links_the_cached_instance() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Person", record(json!({"id": "owner", "firstname": "Owner"})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let animals = session.entity("Animal").unwrap();

    let owner = Completion::new();
    people.get_one(EntityId::from("owner"), false, owner.callback());
    let owner = finished(&owner).unwrap();

    let cat = animals.create();
    cat.set("name", "Tom").unwrap();
    cat.set("owner", "owner").unwrap();
    assert!(cat.reference("owner").unwrap().ptr_eq(&owner));

    cat.set("owner", json!({"id": "stranger"})).unwrap();
    let stranger = cat.reference("owner").unwrap();
    assert!(stranger.is_partially_loaded());
    assert!(people.cached(&EntityId::from("stranger")).unwrap().ptr_eq(&stranger));

    cat.set("owner", Value::Null).unwrap();
    assert!(cat.reference("owner").is_none());
}

#[test]
fn id_is_not_assignable_and_references_are_type_checked() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let animals = session.entity("Animal").unwrap();

    let person = people.create();
    assert!(matches!(person.set("id", "x"), Err(CoreError::Validation(_))));

    let cat = animals.create();
    assert!(matches!(
        person.set_reference("mother", Some(&cat)),
        Err(CoreError::Validation(_))
    ));

    let other_session = open(&backend);
    let stranger = other_session.entity("Person").unwrap().create();
    assert!(matches!(
        person.set_reference("mother", Some(&stranger)),
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        person.set_references("friends", &[stranger]),
        Err(CoreError::Validation(_))
    ));
}

#[test]
fn insert_assigns_id_and_save_then_updates() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let person = people.create();
    person.set("firstname", "Alan").unwrap();
    let saved = Completion::new();
    person.save(saved.callback());
    let saved = finished(&saved);

    assert!(saved.ptr_eq(&person));
    let id = person.id().unwrap();
    assert!(people.cached(&id).unwrap().ptr_eq(&person));
    assert_eq!(backend.calls("insert"), 1);

    person.set("firstname", "Alan M.").unwrap();
    let resaved = Completion::new();
    person.save(resaved.callback());
    finished(&resaved);

    assert_eq!(backend.calls("insert"), 1);
    assert_eq!(backend.calls("update"), 1);
    assert_eq!(
        backend.document("Person", &id).unwrap().get("firstname"),
        Some(&json!("Alan M."))
    );
}

#[test]
fn insert_rejects_instances_that_already_have_an_id() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let stored = people.link(record(json!({"id": "p9", "firstname": "Stored"})));

    let outcome = Completion::new();
    people.insert(&stored, outcome.callback());
    assert!(matches!(
        outcome.take().unwrap(),
        Err(CoreError::Validation(_))
    ));
    assert_eq!(backend.calls("insert"), 0);
}

#[test]
fn distinct_requires_a_key() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed("Animal", record(json!({"name": "Tom"})));
    backend.seed("Animal", record(json!({"name": "Tom"})));
    backend.seed("Animal", record(json!({"name": "Felix"})));
    let session = open(&backend);
    let animals = session.entity("Animal").unwrap();

    let blank = Completion::new();
    animals.distinct("  ", Record::new(), blank.callback());
    assert!(matches!(blank.take().unwrap(), Err(CoreError::Validation(_))));
    assert_eq!(backend.calls("distinct"), 0);

    let names = Completion::new();
    animals.distinct("name", Record::new(), names.callback());
    let mut names = finished(&names);
    names.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    assert_eq!(names, vec![json!("Felix"), json!("Tom")]);
}

#[test]
fn delete_evicts_and_refresh_reports_not_found() {
    let backend = Rc::new(MemoryBackend::new());
    let id = backend.seed("Person", record(json!({"firstname": "Temp"})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let loaded = Completion::new();
    people.get_one(id.clone(), false, loaded.callback());
    let person = finished(&loaded).unwrap();

    let deleted = Completion::new();
    person.delete(deleted.callback());
    finished(&deleted);
    assert!(people.cached(&id).is_none());
    assert!(backend.is_empty("Person"));

    let refreshed = Completion::new();
    person.refresh(refreshed.callback());
    assert!(matches!(
        refreshed.take().unwrap(),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn save_all_reports_every_saved_instance() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let animals = session.entity("Animal").unwrap();

    let owner = people.create();
    owner.set("firstname", "Owner").unwrap();
    let pet = animals.create();
    pet.set("name", "Rex").unwrap();

    let saved = Completion::new();
    session.save_all(&[owner.clone(), pet.clone()], saved.callback());
    let saved = finished(&saved);
    assert_eq!(saved.len(), 2);
    assert!(owner.id().is_some());
    assert!(pet.id().is_some());

    pet.set_reference("owner", Some(&owner)).unwrap();
    let again = Completion::new();
    session.save_all(&[pet.clone()], again.callback());
    finished(&again);
    let stored = backend.document("Animal", &pet.id().unwrap()).unwrap();
    assert_eq!(stored.get("owner"), Some(&json!({"id": owner.id().unwrap().to_json()})));
}

#[test]
fn save_all_stops_at_the_first_failure() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let people = session.entity("Person").unwrap();
    let first = people.create();
    let second = people.create();

    backend.fail_next("disk full");
    let saved = Completion::new();
    session.save_all(&[first, second], saved.callback());
    assert!(matches!(
        saved.take().unwrap(),
        Err(CoreError::BackendUnavailable(_))
    ));
}

#[test]
fn instances_outliving_their_session_report_it() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    let person: Entity = {
        let people = session.entity("Person").unwrap();
        people.link(record(json!({"id": "p1", "firstname": "Orphan"})))
    };
    drop(session);

    let refreshed = Completion::new();
    person.refresh(refreshed.callback());
    assert!(matches!(refreshed.take().unwrap(), Err(CoreError::SessionClosed)));
    assert_eq!(person.text("firstname").as_deref(), Some("Orphan"));
}

#[test]
fn dropping_the_session_frees_cyclic_graphs() {
    let backend = Rc::new(MemoryBackend::new());
    backend.seed(
        "Person",
        record(json!({"id": "a", "friends": [{"id": "b"}], "mother": {"id": "a"}})),
    );
    backend.seed("Person", record(json!({"id": "b", "friends": [{"id": "a"}]})));
    let session = open(&backend);
    let people = session.entity("Person").unwrap();

    let listed = Completion::new();
    people.index(Record::new(), listed.callback());
    let loaded = finished(&listed)
        .iter()
        .map(Entity::downgrade)
        .collect::<Vec<_>>();
    assert_eq!(loaded.len(), 2);

    let x = people.create();
    let y = people.create();
    x.set_references("friends", &[y.clone()]).unwrap();
    y.set_references("friends", &[x.clone()]).unwrap();
    let saved = Completion::new();
    x.save(saved.callback());
    finished(&saved);
    let created = [x.downgrade(), y.downgrade()];
    drop((x, y));

    assert!(loaded.iter().all(|weak| weak.upgrade().is_some()));
    drop(people);
    drop(session);

    assert!(loaded.iter().all(|weak| weak.upgrade().is_none()));
    assert!(created.iter().all(|weak| weak.upgrade().is_none()));
}

#[test]
fn unknown_entity_type_is_a_configuration_error() {
    let backend = Rc::new(MemoryBackend::new());
    let session = open(&backend);
    assert!(matches!(
        session.entity("Dragon"),
        Err(CoreError::Configuration(_))
    ));
    assert_eq!(session.kinds(), vec!["Animal".to_string(), "Person".to_string()]);
    assert_eq!(session.entity("Person").unwrap().resource(), Some("/people"));
}
