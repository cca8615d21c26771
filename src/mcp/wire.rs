//! JSON-RPC 2.0 framing and the envelopes the protocol FSM passes between
//! states. Messages are plain `serde_json::Value`s; one per line on the wire.

use super::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
}

pub fn request(id: impl Into<Value>, method: &str, params: Option<Value>) -> Value {
    let mut message = Map::new();
    message.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
    message.insert("id".to_string(), id.into());
    message.insert("method".to_string(), json!(method));
    if let Some(params) = params {
        message.insert("params".to_string(), params);
    }
    Value::Object(message)
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = Map::new();
    message.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
    message.insert("method".to_string(), json!(method));
    if let Some(params) = params {
        message.insert("params".to_string(), params);
    }
    Value::Object(message)
}

pub fn result_response(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

pub fn error_response(id: &Value, message: &str) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": {"message": message}})
}

/// Synthesized for ids that were still pending at the deadline.
pub fn timeout_response(id: &Value) -> Value {
    error_response(id, "timeout")
}

pub fn is_timeout(response: &Value) -> bool {
    response.pointer("/error/message").and_then(Value::as_str) == Some("timeout")
}

/// Map key for a request id. Numbers and strings stay distinct: `1` and
/// `"1"` are different ids.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(_) | Value::Number(_) => Some(id.to_string()),
        _ => None,
    }
}

pub fn request_id(message: &Value) -> Result<&Value, McpError> {
    message
        .get("id")
        .filter(|id| id_key(id).is_some())
        .ok_or_else(|| McpError::MissingRequestId {
            request: message.to_string(),
        })
}

/// Unwraps a response into its `result`, mapping JSON-RPC errors.
pub fn into_result(response: Value) -> Result<Value, McpError> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        return Err(McpError::Rpc { code, message });
    }
    match response {
        Value::Object(mut fields) => Ok(fields.remove("result").unwrap_or(Value::Null)),
        other => Err(McpError::Protocol {
            reason: format!("response is not an object: {other}"),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response { key: String, message: Value },
    Request { id: Value, method: String },
    Notification { method: String, message: Value },
    Invalid { reason: String },
}

pub fn classify(message: Value) -> Inbound {
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = message.get("id").cloned();
    match (method, id) {
        (Some(method), Some(id)) => Inbound::Request { id, method },
        (Some(method), None) => Inbound::Notification { method, message },
        (None, Some(id)) => match id_key(&id) {
            Some(key) => Inbound::Response { key, message },
            None => Inbound::Invalid {
                reason: format!("response id is not a string or number: {id}"),
            },
        },
        (None, None) => Inbound::Invalid {
            reason: "message has neither id nor method".to_string(),
        },
    }
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": client_name, "version": client_version},
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Response,
    Notification,
    Timeout,
}

/// `{"id":[from,to],"message":wire}`: a message on its way to the server.
pub fn outbound_envelope(from: &str, to: &str, message: Value) -> Value {
    json!({"id": [from, to], "message": message})
}

/// `{"id":[from,to],"type":kind,"data":wire}`: something the server said,
/// or the absence of it.
pub fn inbound_envelope(from: &str, to: &str, kind: EnvelopeKind, data: Value) -> Value {
    json!({"id": [from, to], "type": kind, "data": data})
}

pub fn envelope_message(envelope: &Value) -> Option<&Value> {
    envelope.get("message")
}

/// Inbound envelope answering `outbound`, addressed to the same transition.
pub fn reply_envelope(outbound: &Value, response: Value) -> Value {
    let kind = if is_timeout(&response) {
        EnvelopeKind::Timeout
    } else {
        EnvelopeKind::Response
    };
    json!({
        "id": outbound.get("id").cloned().unwrap_or(Value::Null),
        "type": kind,
        "data": response,
    })
}
