//! Declarative entity schema and the structures derived from it.
//!
//! # Responsibility
//! - Load schema documents (`{ "<Type>": { "resource", "schema" } }`).
//! - Derive the per-type reference map and the shared registry.
//!
//! # Invariants
//! - A loaded `Schema` is immutable.
//! - Every type name is a plain identifier, since backends use it to name
//!   storage collections.

pub mod definition;
pub mod reference_map;
pub mod registry;

pub use definition::{PropertySchema, Schema, TypeDefinition, TypeSchema};
pub use reference_map::{PropertyKind, ReferenceMap, TypeReferences};
pub use registry::Registry;
