use super::context::Context;
use super::definition::{FsmDefinition, StateDef, TransitionDef};
use super::engine::Continuation;
use super::trail::TrailRecord;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything an action sees for one invocation.
pub struct ActionCall<'a> {
    pub context: Context,
    pub definition: &'a FsmDefinition,
    pub transition: &'a TransitionDef,
    pub state: &'a StateDef,
    pub trail: &'a [TrailRecord],
    pub document: &'a Value,
}

/// A state's behavior. Implementations must eventually call
/// [`Continuation::resume`] or [`Continuation::fail`], either before
/// returning or later from another thread.
pub trait Action: Send + Sync {
    fn invoke(&self, call: ActionCall<'_>, continuation: Continuation);
}

impl<F> Action for F
where
    F: Fn(ActionCall<'_>, Continuation) + Send + Sync,
{
    fn invoke(&self, call: ActionCall<'_>, continuation: Continuation) {
        self(call, continuation)
    }
}

/// Pins a closure to the higher-ranked signature [`Action`] needs.
pub fn action_fn<F>(f: F) -> F
where
    F: Fn(ActionCall<'_>, Continuation) + Send + Sync + 'static,
{
    f
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the model (`llm`) and `delegate` actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::model_action::MODEL_ACTION, super::model_action::ModelAction);
        registry.register(super::delegate::DELEGATE_ACTION, super::delegate::DelegateAction);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl Action + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }
}
