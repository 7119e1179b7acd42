//! Schema document model and JSON loading.

use crate::error::{CoreError, CoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

static TYPE_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("type name pattern is valid")
});

/// Full schema: entity-type name to definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    types: BTreeMap<String, TypeDefinition>,
}

/// One entity type: where it is exposed and what it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    #[serde(skip)]
    name: String,
    #[serde(default)]
    resource: Option<String>,
    schema: TypeSchema,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

/// Property declaration. Only the parts that decide reference handling are
/// modeled; other keywords are ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl Schema {
    /// Parses a schema document from JSON text.
    pub fn from_json_str(text: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| CoreError::Configuration(format!("schema is not valid JSON: {err}")))?;
        Self::from_value(value)
    }

    /// Builds a schema from an already parsed JSON document.
    ///
    /// # Errors
    /// - Returns `Configuration` when the document shape is wrong, a type
    ///   name is not a plain identifier, or `schema.id` disagrees with the
    ///   type name it is declared under.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let mut schema: Schema = serde_json::from_value(value)
            .map_err(|err| CoreError::Configuration(format!("malformed schema: {err}")))?;

        for (name, definition) in &mut schema.types {
            if !TYPE_NAME_PATTERN.is_match(name) {
                return Err(CoreError::Configuration(format!(
                    "entity type name `{name}` must match {}",
                    TYPE_NAME_PATTERN.as_str()
                )));
            }
            if let Some(declared) = definition.schema.id.as_deref() {
                if declared != name {
                    return Err(CoreError::Configuration(format!(
                        "entity type `{name}` declares schema id `{declared}`"
                    )));
                }
            }
            definition.name = name.clone();
        }

        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Iterates type definitions in name order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeDefinition {
    /// Entity type name; also the collection name used by backends.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// REST resource path, e.g. `/people`.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.schema.description.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertySchema> {
        &self.schema.properties
    }
}
