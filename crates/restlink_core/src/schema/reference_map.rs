//! Per-type index of reference-bearing properties.
//!
//! # Responsibility
//! - Precompute, once per schema, which properties hold a single reference
//!   and which hold a list of references, together with the target type.
//!
//! # Invariants
//! - `build` is a pure function of the schema.
//! - Targets may name types that are declared later (forward references);
//!   `unresolved_targets` reports the ones that never appear.

use super::definition::{PropertySchema, Schema};
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

/// How the linker must treat one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind<'a> {
    Scalar,
    Reference(&'a str),
    ReferenceList(&'a str),
}

/// Reference-bearing properties of one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeReferences {
    references: BTreeMap<String, String>,
    reference_lists: BTreeMap<String, String>,
}

impl TypeReferences {
    pub fn kind_of(&self, property: &str) -> PropertyKind<'_> {
        if let Some(target) = self.reference_lists.get(property) {
            return PropertyKind::ReferenceList(target.as_str());
        }
        if let Some(target) = self.references.get(property) {
            return PropertyKind::Reference(target.as_str());
        }
        PropertyKind::Scalar
    }

    /// Single-reference properties as `(property, target type)`.
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.references
            .iter()
            .map(|(property, target)| (property.as_str(), target.as_str()))
    }

    /// Reference-list properties as `(property, target type)`.
    pub fn reference_lists(&self) -> impl Iterator<Item = (&str, &str)> {
        self.reference_lists
            .iter()
            .map(|(property, target)| (property.as_str(), target.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.reference_lists.is_empty()
    }
}

/// Reference index for every entity type of a schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    types: BTreeMap<String, TypeReferences>,
}

impl ReferenceMap {
    /// Builds the index.
    ///
    /// # Errors
    /// - Returns `Configuration` for a blank `$ref`, or for `items.$ref` on a
    ///   property that does not declare `type: "array"`.
    pub fn build(schema: &Schema) -> CoreResult<Self> {
        let mut types = BTreeMap::new();

        for definition in schema.types() {
            let mut refs = TypeReferences::default();
            for (property, declaration) in definition.properties() {
                match classify(declaration) {
                    Ok(Classified::Scalar) => {}
                    Ok(Classified::Reference(target)) => {
                        refs.references.insert(property.clone(), target);
                    }
                    Ok(Classified::ReferenceList(target)) => {
                        refs.reference_lists.insert(property.clone(), target);
                    }
                    Err(reason) => {
                        return Err(CoreError::Configuration(format!(
                            "{}.{property}: {reason}",
                            definition.name()
                        )));
                    }
                }
            }
            types.insert(definition.name().to_string(), refs);
        }

        Ok(Self { types })
    }

    pub fn get(&self, kind: &str) -> Option<&TypeReferences> {
        self.types.get(kind)
    }

    /// Lists `(type, property, target)` triples whose target is not declared
    /// in `schema`.
    pub fn unresolved_targets(&self, schema: &Schema) -> Vec<(String, String, String)> {
        let mut unresolved = Vec::new();
        for (kind, refs) in &self.types {
            for (property, target) in refs.references().chain(refs.reference_lists()) {
                if !schema.contains(target) {
                    unresolved.push((kind.clone(), property.to_string(), target.to_string()));
                }
            }
        }
        unresolved
    }
}

enum Classified {
    Scalar,
    Reference(String),
    ReferenceList(String),
}

fn classify(declaration: &PropertySchema) -> Result<Classified, &'static str> {
    let item_target = declaration
        .items
        .as_ref()
        .and_then(|items| items.reference.as_deref());

    if let Some(target) = item_target {
        if declaration.kind.as_deref() != Some("array") {
            return Err("items.$ref requires type \"array\"");
        }
        return non_blank(target).map(Classified::ReferenceList);
    }

    match declaration.reference.as_deref() {
        Some(target) => non_blank(target).map(Classified::Reference),
        None => Ok(Classified::Scalar),
    }
}

fn non_blank(target: &str) -> Result<String, &'static str> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err("$ref cannot be blank");
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::{PropertyKind, ReferenceMap};
    use crate::schema::Schema;
    use serde_json::json;

    fn person_schema() -> Schema {
        Schema::from_value(json!({
            "Person": {"schema": {"properties": {
                "firstname": {"type": "string"},
                "friends": {"type": "array", "items": {"$ref": "Person"}},
                "mother": {"$ref": "Person"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }}},
            "Animal": {"schema": {"properties": {
                "name": {"type": "string"},
                "owner": {"$ref": "Person"}
            }}}
        }))
        .unwrap()
    }

    #[test]
    fn classifies_references_and_lists() {
        let map = ReferenceMap::build(&person_schema()).unwrap();
        let person = map.get("Person").unwrap();

        assert_eq!(person.kind_of("mother"), PropertyKind::Reference("Person"));
        assert_eq!(
            person.kind_of("friends"),
            PropertyKind::ReferenceList("Person")
        );
        assert_eq!(person.kind_of("firstname"), PropertyKind::Scalar);
        assert_eq!(person.kind_of("tags"), PropertyKind::Scalar);
        assert_eq!(person.kind_of("undeclared"), PropertyKind::Scalar);

        let animal = map.get("Animal").unwrap();
        assert_eq!(
            animal.references().collect::<Vec<_>>(),
            vec![("owner", "Person")]
        );
        assert!(animal.reference_lists().next().is_none());
    }

    #[test]
    fn forward_references_build_but_are_reported() {
        let schema = Schema::from_value(json!({
            "Person": {"schema": {"properties": {"pet": {"$ref": "Dog"}}}}
        }))
        .unwrap();

        let map = ReferenceMap::build(&schema).unwrap();
        assert_eq!(
            map.unresolved_targets(&schema),
            vec![("Person".to_string(), "pet".to_string(), "Dog".to_string())]
        );
    }

    #[test]
    fn blank_reference_is_malformed() {
        let schema = Schema::from_value(json!({
            "Person": {"schema": {"properties": {"mother": {"$ref": " "}}}}
        }))
        .unwrap();
        assert!(ReferenceMap::build(&schema).is_err());
    }

    #[test]
    fn item_reference_without_array_type_is_malformed() {
        let schema = Schema::from_value(json!({
            "Person": {"schema": {"properties": {"friends": {"items": {"$ref": "Person"}}}}}
        }))
        .unwrap();
        let err = ReferenceMap::build(&schema).unwrap_err();
        assert!(err.to_string().contains("Person.friends"));
    }
}
