use super::wire::methods;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tools,
    Prompts,
    Resources,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [Self::Tools, Self::Prompts, Self::Resources];

    pub fn list_method(self) -> &'static str {
        match self {
            Self::Tools => methods::TOOLS_LIST,
            Self::Prompts => methods::PROMPTS_LIST,
            Self::Resources => methods::RESOURCES_LIST,
        }
    }

    /// Field of the list result that holds the items.
    pub fn result_field(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Prompts => "prompts",
            Self::Resources => "resources",
        }
    }

    pub fn from_list_changed(method: &str) -> Option<Self> {
        match method {
            methods::TOOLS_LIST_CHANGED => Some(Self::Tools),
            methods::PROMPTS_LIST_CHANGED => Some(Self::Prompts),
            methods::RESOURCES_LIST_CHANGED => Some(Self::Resources),
            _ => None,
        }
    }
}

/// Per-bridge view of what the server offers. A kind is stale until it has
/// been listed, and again after a matching `list_changed` notification.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCache {
    tools: Vec<Value>,
    prompts: Vec<Value>,
    resources: Vec<Value>,
    fresh: BTreeSet<CapabilityKind>,
    server_info: Option<Value>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self, kind: CapabilityKind) -> &[Value] {
        match kind {
            CapabilityKind::Tools => &self.tools,
            CapabilityKind::Prompts => &self.prompts,
            CapabilityKind::Resources => &self.resources,
        }
    }

    pub fn store(&mut self, kind: CapabilityKind, items: Vec<Value>) {
        match kind {
            CapabilityKind::Tools => self.tools = items,
            CapabilityKind::Prompts => self.prompts = items,
            CapabilityKind::Resources => self.resources = items,
        }
        self.fresh.insert(kind);
    }

    pub fn invalidate(&mut self, kind: CapabilityKind) {
        self.fresh.remove(&kind);
    }

    pub fn is_fresh(&self, kind: CapabilityKind) -> bool {
        self.fresh.contains(&kind)
    }

    /// Kinds the server advertises that need (re)listing. Before `initialize`
    /// every kind counts as advertised.
    pub fn stale_kinds(&self) -> Vec<CapabilityKind> {
        CapabilityKind::ALL
            .into_iter()
            .filter(|kind| self.advertises(*kind) && !self.is_fresh(*kind))
            .collect()
    }

    pub fn advertises(&self, kind: CapabilityKind) -> bool {
        match self.server_info.as_ref() {
            Some(info) => info
                .get("capabilities")
                .and_then(|caps| caps.get(kind.result_field()))
                .is_some(),
            None => true,
        }
    }

    pub fn set_server_info(&mut self, info: Value) {
        self.server_info = Some(info);
    }

    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }
}
