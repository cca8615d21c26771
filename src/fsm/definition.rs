use super::FsmError;
use crate::schema::{SchemaRegistry, SchemaValidator};
use crate::shared::ids::{FsmId, StateId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;

/// The `(from, to)` pair that names a transition. Documents declare it under
/// `"id"` as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(StateId, StateId)", into = "(StateId, StateId)")]
pub struct Discriminator {
    pub from: StateId,
    pub to: StateId,
}

impl Discriminator {
    pub fn new(from: StateId, to: StateId) -> Self {
        Self { from, to }
    }

    pub fn parse(from: &str, to: &str) -> Result<Self, String> {
        Ok(Self {
            from: StateId::parse(from)?,
            to: StateId::parse(to)?,
        })
    }

    pub fn of(document: &Value) -> Option<Self> {
        let pair = document.get("id")?.as_array()?;
        if pair.len() != 2 {
            return None;
        }
        Self::parse(pair[0].as_str()?, pair[1].as_str()?).ok()
    }

    pub fn to_value(&self) -> Value {
        json!([self.from.as_str(), self.to.as_str()])
    }
}

impl From<(StateId, StateId)> for Discriminator {
    fn from((from, to): (StateId, StateId)) -> Self {
        Self { from, to }
    }
}

impl From<Discriminator> for (StateId, StateId) {
    fn from(value: Discriminator) -> Self {
        (value.from, value.to)
    }
}

impl std::fmt::Display for Discriminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: StateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hats: Vec<String>,
}

impl StateDef {
    /// States without an action are passive: entry points or terminals.
    pub fn is_passive(&self) -> bool {
        self.action.is_none()
    }
}

fn default_schema() -> Value {
    Value::Bool(true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub id: Discriminator,
    #[serde(default = "default_schema")]
    pub schema: Value,
    #[serde(default)]
    pub omit: bool,
}

impl TransitionDef {
    pub fn from_state(&self) -> &StateId {
        &self.id.from
    }

    pub fn to_state(&self) -> &StateId {
        &self.id.to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmDefinition {
    pub id: FsmId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub states: Vec<StateDef>,
    pub transitions: Vec<TransitionDef>,
    #[serde(default, skip_serializing_if = "SchemaRegistry::is_empty")]
    pub schemas: SchemaRegistry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_state: Option<StateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

pub fn definition_meta_schema() -> &'static Value {
    static META: OnceLock<Value> = OnceLock::new();
    META.get_or_init(|| {
        json!({
            "type": "object",
            "required": ["id", "states", "transitions"],
            "properties": {
                "id": {"type": "string", "minLength": 1},
                "version": {"type": "string"},
                "states": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["id"],
                        "properties": {
                            "id": {"type": "string", "minLength": 1},
                            "action": {"type": "string", "minLength": 1},
                            "prompts": {"type": "array", "items": {"type": "string"}},
                            "hats": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                },
                "transitions": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["id"],
                        "properties": {
                            "id": {
                                "type": "array",
                                "minItems": 2,
                                "maxItems": 2,
                                "items": {"type": "string"}
                            },
                            "schema": {"type": ["object", "boolean"]},
                            "omit": {"type": "boolean"}
                        }
                    }
                },
                "schemas": {"type": "object"},
                "error_state": {"type": "string"},
                "max_retries": {"type": "integer", "minimum": 0}
            }
        })
    })
}

impl FsmDefinition {
    /// Parses and checks a definition: meta-schema first, then structure.
    pub fn from_value(value: Value, validator: &dyn SchemaValidator) -> Result<Self, FsmError> {
        validator
            .validate(&SchemaRegistry::new(), definition_meta_schema(), &value)
            .map_err(|violation| FsmError::InvalidDefinition(violation.to_string()))?;
        let definition: FsmDefinition = serde_json::from_value(value)
            .map_err(|err| FsmError::InvalidDefinition(err.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), FsmError> {
        let mut state_ids = HashSet::new();
        for state in &self.states {
            if !state_ids.insert(state.id.as_str()) {
                return Err(FsmError::InvalidDefinition(format!(
                    "state `{}` is declared more than once",
                    state.id
                )));
            }
        }

        let mut pairs = HashSet::new();
        for transition in &self.transitions {
            if !pairs.insert(&transition.id) {
                return Err(FsmError::InvalidDefinition(format!(
                    "transition {} is declared more than once",
                    transition.id
                )));
            }
            for endpoint in [transition.from_state(), transition.to_state()] {
                if !state_ids.contains(endpoint.as_str()) {
                    return Err(FsmError::InvalidDefinition(format!(
                        "transition {} references undeclared state `{endpoint}`",
                        transition.id
                    )));
                }
            }
            if let Some(reference) = transition.schema.get("$ref").and_then(Value::as_str) {
                if !self.schemas.contains(reference) {
                    return Err(FsmError::InvalidDefinition(format!(
                        "transition {} references unknown schema `{reference}`",
                        transition.id
                    )));
                }
            }
        }

        if !self
            .transitions
            .iter()
            .any(|t| self.is_entry(t))
        {
            return Err(FsmError::InvalidDefinition(
                "no transition leaves a passive entry state".to_string(),
            ));
        }

        for state in &self.states {
            if state.is_passive() {
                continue;
            }
            if self.outgoing(state.id.as_str()).next().is_none() {
                return Err(FsmError::InvalidDefinition(format!(
                    "active state `{}` has no outgoing transitions",
                    state.id
                )));
            }
        }

        if let Some(error_state) = self.error_state.as_ref() {
            if !state_ids.contains(error_state.as_str()) {
                return Err(FsmError::InvalidDefinition(format!(
                    "error_state `{error_state}` is not declared"
                )));
            }
            if !self.is_terminal(error_state.as_str()) {
                return Err(FsmError::InvalidDefinition(format!(
                    "error_state `{error_state}` must not have outgoing transitions"
                )));
            }
        }
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<&StateDef> {
        self.states.iter().find(|state| state.id == id)
    }

    pub fn transition(&self, id: &Discriminator) -> Option<&TransitionDef> {
        self.transitions.iter().find(|t| &t.id == id)
    }

    pub fn outgoing<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a TransitionDef> + 'a {
        self.transitions
            .iter()
            .filter(move |t| t.from_state().as_str() == state)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.outgoing(state).next().is_none()
    }

    pub fn is_entry(&self, transition: &TransitionDef) -> bool {
        self.state(transition.from_state().as_str())
            .is_some_and(StateDef::is_passive)
    }

    pub fn entry_transitions(&self) -> impl Iterator<Item = &TransitionDef> {
        self.transitions.iter().filter(|t| self.is_entry(t))
    }

    /// SHA-256 over the canonical JSON form; ties persisted trails to the
    /// definition that produced them.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BasicSchemaValidator;

    fn echo() -> Value {
        json!({
            "id": "echo",
            "states": [{"id": "start"}, {"id": "mc"}],
            "transitions": [{
                "id": ["start", "mc"],
                "schema": {
                    "type": "object",
                    "required": ["document"],
                    "properties": {"document": {"const": "x"}}
                }
            }]
        })
    }

    #[test]
    fn echo_definition_loads_and_classifies_states() {
        let definition = FsmDefinition::from_value(echo(), &BasicSchemaValidator).expect("load");
        let start_mc = Discriminator::parse("start", "mc").expect("pair");
        let transition = definition.transition(&start_mc).expect("transition");
        assert!(definition.is_entry(transition));
        assert!(definition.is_terminal("mc"));
        assert_eq!(definition.entry_transitions().count(), 1);
    }

    #[test]
    fn discriminator_reads_document_id_pairs_only() {
        assert_eq!(
            Discriminator::of(&json!({"id": ["start", "mc"]})),
            Some(Discriminator::parse("start", "mc").expect("pair"))
        );
        assert_eq!(Discriminator::of(&json!({"id": ["start"]})), None);
        assert_eq!(Discriminator::of(&json!({"id": "start"})), None);
        assert_eq!(Discriminator::of(&json!("text")), None);
    }

    #[test]
    fn duplicate_pairs_and_unknown_states_are_rejected() {
        let mut raw = echo();
        raw["transitions"]
            .as_array_mut()
            .expect("array")
            .push(json!({"id": ["start", "mc"]}));
        let err = FsmDefinition::from_value(raw, &BasicSchemaValidator).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));

        let mut raw = echo();
        raw["transitions"][0]["id"] = json!(["start", "ghost"]);
        let err = FsmDefinition::from_value(raw, &BasicSchemaValidator).expect_err("ghost");
        assert!(err.to_string().contains("undeclared state `ghost`"));
    }

    #[test]
    fn meta_schema_rejects_malformed_transition_ids() {
        let mut raw = echo();
        raw["transitions"][0]["id"] = json!(["start"]);
        let err = FsmDefinition::from_value(raw, &BasicSchemaValidator).expect_err("meta");
        assert!(err.to_string().contains("at least 2 items"));
    }

    #[test]
    fn error_state_must_be_terminal() {
        let raw = json!({
            "id": "guarded",
            "error_state": "work",
            "states": [{"id": "start"}, {"id": "work", "action": "llm"}, {"id": "end"}],
            "transitions": [{"id": ["start", "work"]}, {"id": ["work", "end"]}]
        });
        let err = FsmDefinition::from_value(raw, &BasicSchemaValidator).expect_err("error state");
        assert!(err.to_string().contains("must not have outgoing"));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = FsmDefinition::from_value(echo(), &BasicSchemaValidator).expect("a");
        let b = FsmDefinition::from_value(echo(), &BasicSchemaValidator).expect("b");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let mut changed = echo();
        changed["transitions"][0]["omit"] = json!(true);
        let c = FsmDefinition::from_value(changed, &BasicSchemaValidator).expect("c");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
