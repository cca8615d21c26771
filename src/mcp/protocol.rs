//! The MCP session as an FSM. The machine itself is data; the states that
//! talk to the server are actions registered under `mcp-*` names.
//!
//! ```text
//! start -> starting -> shedding (loops while notifications arrive) -> initing
//!       -> servicing <-> caching
//!          servicing <-> llm -> end
//! ```

use super::bridge::McpBridge;
use super::client::{tool_results, McpClient};
use super::wire::{inbound_envelope, outbound_envelope, EnvelopeKind};
use crate::config::McpServerConfig;
use crate::fsm::{
    Action, ActionCall, ActionRegistry, Context, Continuation, FsmDefinition, FsmError,
    FsmInstance, MODEL_ACTION,
};
use crate::schema::BasicSchemaValidator;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const PROTOCOL_FSM_ID: &str = "mcp-session";
pub const SERVER_VALUE: &str = "mcp.server";
const SHED_COUNT_VALUE: &str = "mcp.shed";
/// Upper bound on consecutive notifications shed before initializing anyway.
pub const SHED_LIMIT: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    Starting,
    Shedding,
    Initing,
    Servicing,
    Caching,
}

impl ProtocolAction {
    pub const ALL: [ProtocolAction; 5] = [
        Self::Starting,
        Self::Shedding,
        Self::Initing,
        Self::Servicing,
        Self::Caching,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Starting => "mcp-starting",
            Self::Shedding => "mcp-shedding",
            Self::Initing => "mcp-initing",
            Self::Servicing => "mcp-servicing",
            Self::Caching => "mcp-caching",
        }
    }
}

pub fn register_protocol_actions(registry: &mut ActionRegistry) {
    for action in ProtocolAction::ALL {
        registry.register(action.name(), action);
    }
}

/// Built-in actions plus the protocol actions.
pub fn protocol_actions() -> ActionRegistry {
    let mut registry = ActionRegistry::with_builtins();
    register_protocol_actions(&mut registry);
    registry
}

pub fn protocol_definition_value() -> Value {
    json!({
        "id": PROTOCOL_FSM_ID,
        "version": "1",
        "schemas": {
            "tool-call": {
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "arguments": {"type": "object"}
                }
            }
        },
        "states": [
            {"id": "start"},
            {"id": "starting", "action": ProtocolAction::Starting.name()},
            {"id": "shedding", "action": ProtocolAction::Shedding.name()},
            {"id": "initing", "action": ProtocolAction::Initing.name()},
            {"id": "servicing", "action": ProtocolAction::Servicing.name()},
            {"id": "caching", "action": ProtocolAction::Caching.name()},
            {
                "id": "llm",
                "action": MODEL_ACTION,
                "prompts": [
                    "You can use the tools listed in the conversation. To call tools reply with {\"id\":[\"llm\",\"servicing\"],\"calls\":[{\"name\":\"<tool>\",\"arguments\":{}}]}. When you have the answer reply with {\"id\":[\"llm\",\"end\"],\"result\":<answer>}."
                ]
            },
            {"id": "end"}
        ],
        "transitions": [
            {
                "id": ["start", "starting"],
                "schema": {
                    "type": "object",
                    "required": ["server", "document"],
                    "properties": {"server": {"type": "string", "minLength": 1}}
                }
            },
            {"id": ["starting", "shedding"], "schema": {"required": ["document"]}},
            {
                "id": ["shedding", "shedding"],
                "omit": true,
                "schema": {"required": ["type", "data"], "properties": {"type": {"const": "notification"}}}
            },
            {
                "id": ["shedding", "initing"],
                "schema": {"required": ["type"], "properties": {"type": {"const": "timeout"}}}
            },
            {
                "id": ["initing", "servicing"],
                "schema": {"required": ["type", "data"], "properties": {"type": {"const": "response"}}}
            },
            {"id": ["servicing", "caching"], "schema": {"required": ["pending"]}},
            {
                "id": ["caching", "servicing"],
                "schema": {
                    "required": ["pending", "refreshed"],
                    "properties": {"refreshed": {"type": "array", "items": {"type": "string"}}}
                }
            },
            {
                "id": ["servicing", "llm"],
                "schema": {"anyOf": [{"required": ["document", "tools"]}, {"required": ["results"]}]}
            },
            {
                "id": ["llm", "servicing"],
                "schema": {
                    "required": ["calls"],
                    "properties": {
                        "calls": {"type": "array", "minItems": 1, "items": {"$ref": "tool-call"}}
                    }
                }
            },
            {"id": ["llm", "end"], "schema": {"required": ["result"]}}
        ]
    })
}

pub fn protocol_definition() -> Result<FsmDefinition, FsmError> {
    FsmDefinition::from_value(protocol_definition_value(), &BasicSchemaValidator)
}

/// Entry document asking `server` to help with `document`.
pub fn protocol_request(server: &str, document: Value) -> Value {
    json!({"id": ["start", "starting"], "server": server, "document": document})
}

/// Starts the protocol FSM. The context's action registry must hold the
/// protocol actions, see [`protocol_actions`].
pub fn start_protocol(context: Context) -> Result<FsmInstance, FsmError> {
    FsmInstance::start(protocol_definition()?, context)
}

fn with_fields(mut base: Value, fields: &[(&str, Value)]) -> Value {
    if let Some(object) = base.as_object_mut() {
        for (key, value) in fields {
            object.insert((*key).to_string(), value.clone());
        }
    }
    base
}

fn server_config(context: &Context, server: &str) -> McpServerConfig {
    context
        .settings
        .mcp_servers
        .get(server)
        .cloned()
        .unwrap_or_else(|| McpServerConfig::new(String::new()))
}

fn session(context: &Context) -> Result<(Arc<McpBridge>, McpServerConfig), String> {
    let server = context
        .value_str(SERVER_VALUE)
        .ok_or_else(|| "no mcp server selected for this run".to_string())?;
    let bridge = context
        .bridges
        .get(server)
        .ok_or_else(|| format!("no bridge is open for server `{server}`"))?;
    Ok((bridge, server_config(context, server)))
}

fn client(context: &Context, bridge: Arc<McpBridge>, config: &McpServerConfig) -> McpClient {
    McpClient::new(bridge, config.request_timeout()).with_interrupt(context.interrupt.clone())
}

impl Action for ProtocolAction {
    fn invoke(&self, call: ActionCall<'_>, continuation: Continuation) {
        let mut context = call.context.clone();
        let outcome = match self {
            Self::Starting => starting(&mut context, call.document),
            Self::Shedding => shedding(&mut context, call.document),
            Self::Initing => initing(&context, call.document),
            Self::Servicing => servicing(&context, call.document),
            Self::Caching => caching(&context, call.document),
        };
        match outcome {
            Ok(output) => continuation.resume(context, output),
            Err(reason) => {
                context.log.error(
                    "mcp.protocol_failed",
                    &format!("action={} reason={reason}", self.name()),
                );
                continuation.fail(context, reason);
            }
        }
    }
}

fn starting(context: &mut Context, document: &Value) -> Result<Value, String> {
    let server = document
        .get("server")
        .and_then(Value::as_str)
        .ok_or_else(|| "entry document names no server".to_string())?
        .to_string();
    let live = context
        .bridges
        .get(&server)
        .filter(|bridge| !bridge.is_closed());
    if live.is_none() {
        let config = context
            .settings
            .server(&server)
            .map_err(|err| err.to_string())?
            .clone();
        context
            .bridges
            .open_or_reuse(&server, &config)
            .map_err(|err| err.to_string())?;
    }
    context
        .values
        .insert(SERVER_VALUE.to_string(), Value::String(server));
    context.values.remove(SHED_COUNT_VALUE);
    Ok(json!({
        "id": ["starting", "shedding"],
        "document": document.get("document").cloned().unwrap_or(Value::Null),
    }))
}

fn shedding(context: &mut Context, document: &Value) -> Result<Value, String> {
    let (bridge, config) = session(context)?;
    let carried = document.get("document").cloned().unwrap_or(Value::Null);
    let shed = context
        .values
        .get(SHED_COUNT_VALUE)
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let notification = if shed < SHED_LIMIT {
        bridge.recv_notification(config.shed_timeout())
    } else {
        None
    };
    match notification {
        Some(message) => {
            context
                .values
                .insert(SHED_COUNT_VALUE.to_string(), json!(shed + 1));
            let envelope =
                inbound_envelope("shedding", "shedding", EnvelopeKind::Notification, message);
            Ok(with_fields(envelope, &[("document", carried)]))
        }
        None => {
            context.values.remove(SHED_COUNT_VALUE);
            let envelope = inbound_envelope("shedding", "initing", EnvelopeKind::Timeout, Value::Null);
            Ok(with_fields(envelope, &[("document", carried)]))
        }
    }
}

fn initing(context: &Context, document: &Value) -> Result<Value, String> {
    let (bridge, config) = session(context)?;
    let result = client(context, bridge, &config)
        .initialize()
        .map_err(|err| err.to_string())?;
    let carried = document.get("document").cloned().unwrap_or(Value::Null);
    let envelope = inbound_envelope("initing", "servicing", EnvelopeKind::Response, result);
    Ok(with_fields(envelope, &[("document", carried)]))
}

fn servicing(context: &Context, document: &Value) -> Result<Value, String> {
    let (bridge, config) = session(context)?;
    let work = document.get("pending").unwrap_or(document);

    while let Some(message) = bridge.try_recv_notification() {
        context.log.info(
            "mcp.notification",
            &format!(
                "server={} method={}",
                bridge.server(),
                message.get("method").and_then(Value::as_str).unwrap_or("?")
            ),
        );
    }

    if !bridge.cache().stale_kinds().is_empty() {
        return Ok(json!({"id": ["servicing", "caching"], "pending": strip_id(work)}));
    }

    let client = client(context, bridge, &config);
    if let Some(calls) = work.get("calls").and_then(Value::as_array) {
        let outbound: Vec<Value> = client
            .tool_call_requests(calls)
            .into_iter()
            .map(|request| outbound_envelope("servicing", "llm", request))
            .collect();
        let replies = client.exchange(&outbound).map_err(|err| err.to_string())?;
        let results = tool_results(
            calls,
            replies
                .into_iter()
                .map(|reply| reply.get("data").cloned().unwrap_or(Value::Null)),
        );
        let mut output = json!({"id": ["servicing", "llm"], "results": results});
        // Back from caching: the model sees the refreshed tool list.
        if document.get("refreshed").is_some() {
            output["tools"] = json!(client.tools());
        }
        return Ok(output);
    }
    Ok(json!({
        "id": ["servicing", "llm"],
        "document": work.get("document").cloned().unwrap_or(Value::Null),
        "tools": client.tools(),
    }))
}

fn caching(context: &Context, document: &Value) -> Result<Value, String> {
    let (bridge, config) = session(context)?;
    let refreshed = client(context, bridge, &config)
        .refresh()
        .map_err(|err| err.to_string())?;
    Ok(json!({
        "id": ["caching", "servicing"],
        "pending": document.get("pending").cloned().unwrap_or(Value::Null),
        "refreshed": refreshed,
    }))
}

fn strip_id(work: &Value) -> Value {
    match work {
        Value::Object(fields) => {
            let kept: Map<String, Value> = fields
                .iter()
                .filter(|(key, _)| key.as_str() != "id")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(kept)
        }
        other => other.clone(),
    }
}
