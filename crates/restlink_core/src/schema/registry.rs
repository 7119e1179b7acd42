//! Shared, immutable registry of entity types for one factory.

use super::definition::{Schema, TypeDefinition};
use super::reference_map::{PropertyKind, ReferenceMap, TypeReferences};
use crate::error::{CoreError, CoreResult};
use log::{error, info};

/// Schema plus its reference index, built once and shared by every session
/// of a factory.
#[derive(Debug)]
pub struct Registry {
    schema: Schema,
    references: ReferenceMap,
}

impl Registry {
    /// Builds the registry and verifies every reference target is declared.
    ///
    /// # Errors
    /// - Returns `Configuration` when the schema is empty, malformed, or
    ///   references an undeclared entity type.
    pub fn new(schema: Schema) -> CoreResult<Self> {
        if schema.is_empty() {
            return Err(CoreError::Configuration(
                "schema declares no entity types".to_string(),
            ));
        }

        let references = ReferenceMap::build(&schema)?;
        let unresolved = references.unresolved_targets(&schema);
        if !unresolved.is_empty() {
            let listed = unresolved
                .iter()
                .map(|(kind, property, target)| format!("{kind}.{property} -> {target}"))
                .collect::<Vec<_>>()
                .join(", ");
            error!(
                "event=registry_build module=schema status=error error_code=unknown_ref_target targets={}",
                listed
            );
            return Err(CoreError::Configuration(format!(
                "schema references undeclared entity types: {listed}"
            )));
        }

        info!(
            "event=registry_build module=schema status=ok types={}",
            schema.len()
        );
        Ok(Self { schema, references })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn definition(&self, kind: &str) -> Option<&TypeDefinition> {
        self.schema.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.schema.contains(kind)
    }

    pub fn references(&self, kind: &str) -> Option<&TypeReferences> {
        self.references.get(kind)
    }

    /// Classifies one property; unknown types and properties are scalars.
    pub fn property_kind(&self, kind: &str, property: &str) -> PropertyKind<'_> {
        self.references
            .get(kind)
            .map_or(PropertyKind::Scalar, |refs| refs.kind_of(property))
    }

    /// Entity type names in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schema.types().map(TypeDefinition::name)
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::error::CoreError;
    use crate::schema::{PropertyKind, Schema};
    use serde_json::json;

    #[test]
    fn unknown_reference_target_is_fatal() {
        let schema = Schema::from_value(json!({
            "Animal": {"schema": {"properties": {"owner": {"$ref": "Person"}}}}
        }))
        .unwrap();

        let err = Registry::new(schema).unwrap_err();
        match err {
            CoreError::Configuration(message) => assert!(message.contains("Animal.owner -> Person")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_schema_is_rejected() {
        assert!(Registry::new(Schema::default()).is_err());
    }

    #[test]
    fn exposes_property_kinds() {
        let schema = Schema::from_value(json!({
            "Person": {"schema": {"properties": {"mother": {"$ref": "Person"}}}}
        }))
        .unwrap();
        let registry = Registry::new(schema).unwrap();

        assert_eq!(
            registry.property_kind("Person", "mother"),
            PropertyKind::Reference("Person")
        );
        assert_eq!(
            registry.property_kind("Ghost", "mother"),
            PropertyKind::Scalar
        );
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["Person"]);
    }
}
