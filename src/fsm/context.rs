use super::action::ActionRegistry;
use super::definition::{FsmDefinition, StateDef};
use super::engine::FsmInstance;
use super::interrupt::InterruptCell;
use super::FsmError;
use crate::config::EngineSettings;
use crate::mcp::BridgeRegistry;
use crate::model::{ModelClient, PromptMessage};
use crate::schema::{BasicSchemaValidator, SchemaValidator};
use crate::shared::ids::FsmId;
use crate::shared::logging::LogSink;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Prompt middleware applied by the model action to states that list it.
pub trait Hat: Send + Sync {
    fn decorate(&self, state: &StateDef, messages: &mut Vec<PromptMessage>);
}

#[derive(Default)]
pub struct HatRegistry {
    hats: BTreeMap<String, Arc<dyn Hat>>,
}

impl HatRegistry {
    pub fn register(&mut self, name: impl Into<String>, hat: Arc<dyn Hat>) {
        self.hats.insert(name.into(), hat);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Hat>> {
        self.hats.get(name).cloned()
    }
}

/// Definitions a delegate action may start as child FSMs.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: BTreeMap<FsmId, Arc<FsmDefinition>>,
}

impl DefinitionRegistry {
    pub fn register(&mut self, definition: FsmDefinition) {
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn get(&self, fsm_id: &str) -> Option<Arc<FsmDefinition>> {
        self.definitions.get(fsm_id).cloned()
    }
}

/// Child instances started by delegate actions, reused by fsm id.
#[derive(Default)]
pub struct ChildCache {
    children: Mutex<HashMap<String, Arc<FsmInstance>>>,
}

impl ChildCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<FsmInstance>>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_start(
        &self,
        fsm_id: &str,
        start: impl FnOnce() -> Result<FsmInstance, FsmError>,
    ) -> Result<Arc<FsmInstance>, FsmError> {
        let mut children = self.lock();
        if let Some(existing) = children.get(fsm_id) {
            if !existing.is_stopped() {
                return Ok(existing.clone());
            }
        }
        let instance = Arc::new(start()?);
        children.insert(fsm_id.to_string(), instance.clone());
        Ok(instance)
    }

    pub fn evict(&self, fsm_id: &str) {
        let removed = self.lock().remove(fsm_id);
        if let Some(child) = removed {
            child.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_all(&self) {
        let children: Vec<_> = self.lock().drain().map(|(_, child)| child).collect();
        for child in children {
            child.stop();
        }
    }
}

/// Execution-scoped state threaded through every action call. Shared parts
/// sit behind `Arc`s; `feedback` and `values` travel with each invocation.
#[derive(Clone)]
pub struct Context {
    pub actions: Arc<ActionRegistry>,
    pub validator: Arc<dyn SchemaValidator>,
    pub bridges: Arc<BridgeRegistry>,
    pub hats: Arc<HatRegistry>,
    pub interrupt: Arc<InterruptCell>,
    pub model: Option<Arc<dyn ModelClient>>,
    pub settings: Arc<EngineSettings>,
    pub definitions: Arc<DefinitionRegistry>,
    pub children: Arc<ChildCache>,
    pub log: LogSink,
    pub feedback: Vec<Value>,
    pub values: Map<String, Value>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("actions", &self.actions.names())
            .field("interrupt", &self.interrupt)
            .field("has_model", &self.model.is_some())
            .field("feedback", &self.feedback)
            .field("values", &self.values)
            .finish()
    }
}

impl Context {
    pub fn new(actions: ActionRegistry, settings: EngineSettings) -> Self {
        let log = settings
            .log_root
            .as_ref()
            .map(LogSink::new)
            .unwrap_or_default();
        Self {
            actions: Arc::new(actions),
            validator: Arc::new(BasicSchemaValidator),
            bridges: Arc::new(BridgeRegistry::new(log.clone())),
            hats: Arc::new(HatRegistry::default()),
            interrupt: Arc::new(InterruptCell::new()),
            model: None,
            settings: Arc::new(settings),
            definitions: Arc::new(DefinitionRegistry::default()),
            children: Arc::new(ChildCache::default()),
            log,
            feedback: Vec::new(),
            values: Map::new(),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_hats(mut self, hats: HatRegistry) -> Self {
        self.hats = Arc::new(hats);
        self
    }

    pub fn with_definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = Arc::new(definitions);
        self
    }

    pub fn with_bridges(mut self, bridges: Arc<BridgeRegistry>) -> Self {
        self.bridges = bridges;
        self
    }

    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Context for a child FSM: same registries and clients, its own bridges,
    /// interrupt cell and child cache.
    pub fn child(&self) -> Self {
        Self {
            actions: self.actions.clone(),
            validator: self.validator.clone(),
            bridges: Arc::new(BridgeRegistry::new(self.log.clone())),
            hats: self.hats.clone(),
            interrupt: Arc::new(InterruptCell::new()),
            model: self.model.clone(),
            settings: self.settings.clone(),
            definitions: self.definitions.clone(),
            children: Arc::new(ChildCache::default()),
            log: self.log.clone(),
            feedback: Vec::new(),
            values: Map::new(),
        }
    }

    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Sets the interrupt flag and runs the composed cleanup once.
    pub fn interrupt(&self) -> bool {
        self.interrupt.interrupt()
    }
}
