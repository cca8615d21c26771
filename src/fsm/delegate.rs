use super::action::{Action, ActionCall};
use super::definition::{Discriminator, FsmDefinition, StateDef};
use super::engine::{AwaitOutcome, Continuation, FsmInstance};
use super::trail::{Trail, TrailRecord};
use super::FsmError;
use crate::shared::ids::StateId;
use crate::shared::serde_ext::{parse_via_string, serialize_as_str};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Action name under which [`DelegateAction`] is registered.
pub const DELEGATE_ACTION: &str = "delegate";

/// How much of the child's trail is folded into the parent's event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailMode {
    Omit,
    #[default]
    Summary,
    Full,
}

impl TrailMode {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "omit" => Ok(Self::Omit),
            "summary" => Ok(Self::Summary),
            "full" => Ok(Self::Full),
            other => Err(format!("expected omit, summary or full, got `{other}`")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Omit => "omit",
            Self::Summary => "summary",
            Self::Full => "full",
        }
    }
}

impl Serialize for TrailMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_as_str(serializer, self.as_str())
    }
}

impl<'de> Deserialize<'de> for TrailMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_via_string(deserializer, "trail mode", Self::parse)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegateConfig {
    pub fsm: String,
    #[serde(default)]
    pub entry: Option<Discriminator>,
    #[serde(default)]
    pub trail_mode: TrailMode,
    #[serde(default)]
    pub next: Option<StateId>,
}

impl DelegateConfig {
    pub fn from_state(state: &StateDef) -> Result<Self, FsmError> {
        serde_json::from_value(state.config.clone()).map_err(|err| FsmError::ActionConfig {
            state: state.id.to_string(),
            reason: err.to_string(),
        })
    }

    /// The parent transition taken once the child completes: `next` when
    /// configured, else the state's only outgoing transition.
    fn parent_target(
        &self,
        definition: &FsmDefinition,
        state: &StateDef,
    ) -> Result<StateId, FsmError> {
        if let Some(next) = self.next.as_ref() {
            return Ok(next.clone());
        }
        let mut outgoing = definition.outgoing(state.id.as_str());
        match (outgoing.next(), outgoing.next()) {
            (Some(only), None) => Ok(only.to_state().clone()),
            _ => Err(FsmError::ActionConfig {
                state: state.id.to_string(),
                reason: "`next` is required when the state has several outgoing transitions"
                    .to_string(),
            }),
        }
    }

    fn child_entry(&self, child: &FsmDefinition) -> Result<Discriminator, FsmError> {
        if let Some(entry) = self.entry.as_ref() {
            return Ok(entry.clone());
        }
        let mut entries = child.entry_transitions();
        match (entries.next(), entries.next()) {
            (Some(only), None) => Ok(only.id.clone()),
            _ => Err(FsmError::ActionConfig {
                state: self.fsm.clone(),
                reason: format!(
                    "fsm `{}` has several entry transitions; configure `entry`",
                    child.id
                ),
            }),
        }
    }
}

/// Runs a child FSM to completion and reports it to the parent as a single
/// event. The parent trail does not change while the child runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegateAction;

impl Action for DelegateAction {
    fn invoke(&self, call: ActionCall<'_>, continuation: Continuation) {
        let context = call.context.clone();
        match delegate(&call) {
            Ok(Delegated::Output(output)) => continuation.resume(context, output),
            Ok(Delegated::Interrupted) => continuation.resume(context, Value::Null),
            Err(err) => {
                context.log.error(
                    "delegate.failed",
                    &format!("state={} error={err}", call.state.id),
                );
                continuation.fail(context, err.to_string());
            }
        }
    }
}

enum Delegated {
    Output(Value),
    Interrupted,
}

fn delegate(call: &ActionCall<'_>) -> Result<Delegated, FsmError> {
    let context = &call.context;
    let config = DelegateConfig::from_state(call.state)?;
    let target = config.parent_target(call.definition, call.state)?;
    let child_definition =
        context
            .definitions
            .get(&config.fsm)
            .ok_or_else(|| FsmError::UnknownFsm {
                fsm_id: config.fsm.clone(),
            })?;
    let entry = config.child_entry(&child_definition)?;

    let child = context.children.get_or_start(&config.fsm, || {
        FsmInstance::start(child_definition.clone(), context.child())
    })?;

    let cancel_child = Arc::clone(&child);
    let token = match context.interrupt.compose(move || {
        cancel_child.interrupt();
    }) {
        Ok(token) => token,
        Err(_) => return Ok(Delegated::Interrupted),
    };

    let submitted = child.submit(readdress(call.document, &entry));
    if let Err(err) = submitted {
        context.interrupt.release(token);
        return Err(err);
    }
    let outcome = child.await_outcome(context.settings.await_timeout());
    context.interrupt.release(token);

    match outcome {
        AwaitOutcome::Completed {
            trail, document, ..
        } => {
            context.log.info(
                "delegate.completed",
                &format!(
                    "fsm={} steps={} trail_mode={}",
                    config.fsm,
                    trail.len(),
                    config.trail_mode.as_str()
                ),
            );
            let mut output = Map::new();
            output.insert(
                "id".to_string(),
                json!([call.state.id.as_str(), target.as_str()]),
            );
            output.insert("result".to_string(), document);
            match config.trail_mode {
                TrailMode::Omit => {}
                TrailMode::Summary => {
                    output.insert("fsm".to_string(), Value::String(config.fsm.clone()));
                    output.insert("trail".to_string(), summarize(&trail));
                }
                TrailMode::Full => {
                    let full = serde_json::to_value(&trail).map_err(|source| FsmError::Json {
                        path: format!("trail of child fsm `{}`", config.fsm),
                        source,
                    })?;
                    output.insert("fsm".to_string(), Value::String(config.fsm.clone()));
                    output.insert("trail".to_string(), full);
                }
            }
            Ok(Delegated::Output(Value::Object(output)))
        }
        AwaitOutcome::Failed { state, reason, .. } => Err(FsmError::ChildFailed {
            fsm_id: config.fsm.clone(),
            reason: format!("failed in `{state}`: {reason}"),
        }),
        AwaitOutcome::Interrupted { .. } => {
            context.children.evict(&config.fsm);
            if context.interrupt.is_interrupted() {
                Ok(Delegated::Interrupted)
            } else {
                Err(FsmError::Interrupted {
                    instance_id: child.id().to_string(),
                })
            }
        }
        AwaitOutcome::TimedOut => {
            context.children.evict(&config.fsm);
            Err(FsmError::ChildFailed {
                fsm_id: config.fsm.clone(),
                reason: format!(
                    "no outcome within {:?}",
                    context.settings.await_timeout()
                ),
            })
        }
    }
}

/// Copies `document` with its discriminator replaced by the child's entry.
fn readdress(document: &Value, entry: &Discriminator) -> Value {
    let mut fields = match document {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut fields = Map::new();
            fields.insert("document".to_string(), other.clone());
            fields
        }
    };
    fields.insert("id".to_string(), entry.to_value());
    Value::Object(fields)
}

fn summarize(trail: &Trail) -> Value {
    let events: Vec<&Value> = trail
        .records()
        .iter()
        .filter_map(|record| match record {
            TrailRecord::Success { event, .. } => Some(event),
            TrailRecord::Failure { .. } => None,
        })
        .collect();
    json!({
        "steps": trail.len(),
        "first": events.first().copied().cloned().unwrap_or(Value::Null),
        "last": events.last().copied().cloned().unwrap_or(Value::Null),
    })
}
