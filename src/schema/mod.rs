//! Schema validation is a supplied capability: the engine only depends on the
//! [`SchemaValidator`] trait. [`BasicSchemaValidator`] covers the JSON Schema
//! keywords the engine's own definitions use.

pub mod render;
pub mod validator;

pub use render::{render_schema_reference, render_transition_schemas};
pub use validator::BasicSchemaValidator;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", errors.join("; "))]
pub struct SchemaViolation {
    pub errors: Vec<String>,
}

impl SchemaViolation {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

pub trait SchemaValidator: Send + Sync {
    fn validate(
        &self,
        registry: &SchemaRegistry,
        schema: &Value,
        document: &Value,
    ) -> Result<(), SchemaViolation>;
}

/// Named schemas a definition's transitions may reference with `{"$ref": name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry(BTreeMap<String, Value>);

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: Value) {
        self.0.insert(name.into(), schema);
    }

    /// Accepts `name`, `#/$defs/name` and `#/definitions/name`.
    pub fn resolve(&self, reference: &str) -> Option<&Value> {
        let name = reference
            .strip_prefix("#/$defs/")
            .or_else(|| reference.strip_prefix("#/definitions/"))
            .unwrap_or(reference);
        self.0.get(name)
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.resolve(reference).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, Value)> for SchemaRegistry {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
