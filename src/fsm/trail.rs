use super::definition::{Discriminator, FsmDefinition};
use super::engine::INTERRUPTED_STATE;
use super::model_action::MODEL_ACTION;
use super::FsmError;
use crate::model::{PromptMessage, PromptRole};
use crate::schema::SchemaValidator;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::StateId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrailRecord {
    Success {
        from: StateId,
        to: StateId,
        event: Value,
    },
    Failure {
        from: StateId,
        event: Value,
        failure: Value,
    },
}

impl TrailRecord {
    pub fn from_state(&self) -> &StateId {
        match self {
            Self::Success { from, .. } | Self::Failure { from, .. } => from,
        }
    }

    pub fn event(&self) -> &Value {
        match self {
            Self::Success { event, .. } | Self::Failure { event, .. } => event,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// Append-only log of the transitions a run actually took.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trail {
    records: Vec<TrailRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTrail {
    fingerprint: String,
    records: Vec<TrailRecord>,
}

impl Trail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<TrailRecord>) -> Self {
        Self { records }
    }

    pub fn append(&mut self, record: TrailRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TrailRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&TrailRecord> {
        self.records.last()
    }

    /// Success records as prompt messages. The voice comes from the action
    /// of the state that produced the event, not from routing direction.
    pub fn project(&self, definition: &FsmDefinition) -> Vec<PromptMessage> {
        self.records
            .iter()
            .filter_map(|record| match record {
                TrailRecord::Success { from, event, .. } => {
                    let produced_by_model = definition
                        .state(from.as_str())
                        .and_then(|state| state.action.as_deref())
                        == Some(MODEL_ACTION);
                    let role = if produced_by_model {
                        PromptRole::Assistant
                    } else {
                        PromptRole::User
                    };
                    Some(PromptMessage::new(role, event.to_string()))
                }
                TrailRecord::Failure { .. } => None,
            })
            .collect()
    }

    pub fn save(&self, path: &Path, fingerprint: &str) -> Result<(), FsmError> {
        let persisted = PersistedTrail {
            fingerprint: fingerprint.to_string(),
            records: self.records.clone(),
        };
        atomic_write_json(path, &persisted).map_err(|source| FsmError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Returns the recorded definition fingerprint alongside the trail.
    pub fn load(path: &Path) -> Result<(String, Self), FsmError> {
        let raw = fs::read_to_string(path).map_err(|source| FsmError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let persisted: PersistedTrail =
            serde_json::from_str(&raw).map_err(|source| FsmError::Json {
                path: path.display().to_string(),
                source,
            })?;
        Ok((
            persisted.fingerprint,
            Self {
                records: persisted.records,
            },
        ))
    }
}

/// Re-checks a persisted trail against `definition`: every success record
/// must carry a matching discriminator, validate against its declared
/// transition and continue from the previous state. Omitted hops are
/// bridged through the definition's `omit` transitions. The interrupt record
/// and an undeclared hop into `error_state` are accepted as the last record
/// of a run.
pub fn replay(
    definition: &FsmDefinition,
    validator: &dyn SchemaValidator,
    trail: &Trail,
) -> Result<(), FsmError> {
    let mut current: Option<&StateId> = None;
    let mut ended = false;
    for (index, record) in trail.records().iter().enumerate() {
        let TrailRecord::Success { from, to, event } = record else {
            continue;
        };
        if ended {
            return Err(FsmError::Replay {
                index,
                reason: "record follows the end of the run".to_string(),
            });
        }
        let pair = Discriminator::new(from.clone(), to.clone());
        if Discriminator::of(event).as_ref() != Some(&pair) {
            return Err(FsmError::Replay {
                index,
                reason: format!("event does not declare {pair}"),
            });
        }
        match definition.transition(&pair) {
            Some(transition) => {
                validator
                    .validate(&definition.schemas, &transition.schema, event)
                    .map_err(|violation| FsmError::Replay {
                        index,
                        reason: violation.to_string(),
                    })?;
                ended = definition.error_state.as_ref() == Some(to);
            }
            None if to.as_str() == INTERRUPTED_STATE => ended = true,
            None if definition.error_state.as_ref() == Some(to) => {
                if event.get("failure").is_none() {
                    return Err(FsmError::Replay {
                        index,
                        reason: format!("error record {pair} carries no failure"),
                    });
                }
                ended = true;
            }
            None => {
                return Err(FsmError::Replay {
                    index,
                    reason: format!("transition {pair} is not declared"),
                })
            }
        }
        if let Some(previous) = current {
            let continues = previous == from
                || from.as_str() == INTERRUPTED_STATE
                || reachable_by_omitted(definition, previous, from);
            if !continues {
                return Err(FsmError::Replay {
                    index,
                    reason: format!("expected a transition from `{previous}`, got `{from}`"),
                });
            }
        }
        current = Some(to);
    }
    Ok(())
}

fn reachable_by_omitted(definition: &FsmDefinition, from: &StateId, target: &StateId) -> bool {
    let mut seen: HashSet<&StateId> = HashSet::new();
    let mut frontier = vec![from];
    while let Some(state) = frontier.pop() {
        for transition in definition.outgoing(state.as_str()).filter(|t| t.omit) {
            let next = transition.to_state();
            if next == target {
                return true;
            }
            if seen.insert(next) {
                frontier.push(next);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BasicSchemaValidator;
    use serde_json::json;
    use tempfile::tempdir;

    fn state(id: &str) -> StateId {
        StateId::parse(id).expect("state id")
    }

    fn definition() -> FsmDefinition {
        FsmDefinition::from_value(
            json!({
                "id": "chat",
                "states": [
                    {"id": "start"},
                    {"id": "llm", "action": "llm"},
                    {"id": "tool", "action": "mcp-servicing"},
                    {"id": "end"}
                ],
                "transitions": [
                    {"id": ["start", "llm"]},
                    {"id": ["llm", "tool"]},
                    {"id": ["tool", "llm"]},
                    {"id": ["llm", "end"], "schema": {"required": ["answer"]}}
                ]
            }),
            &BasicSchemaValidator,
        )
        .expect("definition")
    }

    fn success(from: &str, to: &str, extra: Value) -> TrailRecord {
        let mut event = json!({"id": [from, to]});
        if let (Some(target), Some(source)) = (event.as_object_mut(), extra.as_object()) {
            target.extend(source.clone());
        }
        TrailRecord::Success {
            from: state(from),
            to: state(to),
            event,
        }
    }

    #[test]
    fn records_serialize_in_persisted_layout() {
        let ok = success("start", "llm", json!({}));
        assert_eq!(
            serde_json::to_value(&ok).expect("json"),
            json!({"from": "start", "to": "llm", "event": {"id": ["start", "llm"]}})
        );
        let failed = TrailRecord::Failure {
            from: state("llm"),
            event: json!("garbage"),
            failure: json!({"errors": ["missing id"]}),
        };
        let value = serde_json::to_value(&failed).expect("json");
        assert!(value.get("to").is_none());
        let back: TrailRecord = serde_json::from_value(value).expect("back");
        assert!(back.is_failure());
    }

    #[test]
    fn projection_voices_model_output_as_assistant() {
        let mut trail = Trail::new();
        trail.append(success("start", "llm", json!({"q": 1})));
        trail.append(success("llm", "tool", json!({"calls": []})));
        trail.append(success("tool", "llm", json!({"results": []})));
        trail.append(TrailRecord::Failure {
            from: state("llm"),
            event: json!("bad"),
            failure: json!({}),
        });

        let roles: Vec<PromptRole> = trail
            .project(&definition())
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![PromptRole::User, PromptRole::Assistant, PromptRole::User]
        );
    }

    #[test]
    fn saved_trail_replays_against_its_definition() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trail.json");
        let definition = definition();
        let mut trail = Trail::new();
        trail.append(success("start", "llm", json!({})));
        trail.append(success("llm", "end", json!({"answer": 42})));
        trail.save(&path, &definition.fingerprint()).expect("save");

        let (fingerprint, loaded) = Trail::load(&path).expect("load");
        assert_eq!(fingerprint, definition.fingerprint());
        assert_eq!(loaded, trail);
        replay(&definition, &BasicSchemaValidator, &loaded).expect("replay");
    }

    #[test]
    fn replay_detects_schema_and_continuity_breaks() {
        let definition = definition();
        let mut invalid = Trail::new();
        invalid.append(success("start", "llm", json!({})));
        invalid.append(success("llm", "end", json!({})));
        let err = replay(&definition, &BasicSchemaValidator, &invalid).expect_err("schema");
        assert!(matches!(err, FsmError::Replay { index: 1, .. }));

        let mut gap = Trail::new();
        gap.append(success("start", "llm", json!({})));
        gap.append(success("tool", "llm", json!({})));
        let err = replay(&definition, &BasicSchemaValidator, &gap).expect_err("gap");
        assert!(err.to_string().contains("expected a transition from `llm`"));
    }
}
