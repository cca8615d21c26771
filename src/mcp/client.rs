use super::bridge::{McpBridge, ResponseSlot};
use super::cache::CapabilityKind;
use super::wire::{self, methods};
use super::McpError;
use crate::fsm::InterruptCell;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sends `requests` as one batch and returns one response per request, in
/// request order. Ids still pending at the shared deadline get a synthesized
/// timeout response and are removed from the pending table.
pub fn call_batch(
    bridge: &McpBridge,
    requests: &[Value],
    timeout: Duration,
) -> Result<Vec<Value>, McpError> {
    let slots = register_all(bridge, requests)?;
    await_all(bridge, requests, slots, timeout)
}

fn register_all(bridge: &McpBridge, requests: &[Value]) -> Result<Vec<ResponseSlot>, McpError> {
    let mut slots: Vec<ResponseSlot> = Vec::with_capacity(requests.len());
    for request in requests {
        let registered = wire::request_id(request).and_then(|id| bridge.register(id));
        match registered {
            Ok(slot) => slots.push(slot),
            Err(err) => {
                for slot in &slots {
                    bridge.unregister(slot.key());
                }
                return Err(err);
            }
        }
    }
    Ok(slots)
}

fn await_all(
    bridge: &McpBridge,
    requests: &[Value],
    slots: Vec<ResponseSlot>,
    timeout: Duration,
) -> Result<Vec<Value>, McpError> {
    let mut write_failures = vec![None; requests.len()];
    for (index, (request, slot)) in requests.iter().zip(&slots).enumerate() {
        if let Err(err) = bridge.send(request) {
            if bridge.unregister(slot.key()) {
                write_failures[index] = Some(err.to_string());
            }
        }
    }

    let deadline = Instant::now() + timeout;
    let mut responses = Vec::with_capacity(requests.len());
    for ((request, slot), write_failure) in requests.iter().zip(&slots).zip(write_failures) {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        if let Some(reason) = write_failure {
            responses.push(wire::error_response(&id, &reason));
            continue;
        }
        if let Some(response) = slot.wait_until(deadline) {
            responses.push(response);
            continue;
        }
        if !bridge.unregister(slot.key()) {
            if let Some(response) = slot.try_take() {
                responses.push(response);
                continue;
            }
        }
        bridge.log().warn(
            "mcp.timeout",
            &format!(
                "server={} id={} method={}",
                bridge.server(),
                slot.key(),
                request.get("method").and_then(Value::as_str).unwrap_or("?")
            ),
        );
        responses.push(wire::timeout_response(&id));
    }
    Ok(responses)
}

/// Like [`call_batch`], but an interrupt resolves every still-pending id of
/// the batch with an `interrupted` error response.
pub fn call_batch_interruptible(
    bridge: &Arc<McpBridge>,
    requests: &[Value],
    timeout: Duration,
    interrupt: &InterruptCell,
) -> Result<Vec<Value>, McpError> {
    let slots = register_all(bridge, requests)?;
    let keys: Vec<String> = slots.iter().map(|slot| slot.key().to_string()).collect();
    let cancel_bridge = bridge.clone();
    let cancel_keys = keys.clone();
    let token = match interrupt.compose(move || cancel_bridge.cancel(&cancel_keys, "interrupted")) {
        Ok(token) => token,
        Err(_) => {
            return Ok(requests
                .iter()
                .map(|request| {
                    wire::error_response(request.get("id").unwrap_or(&Value::Null), "interrupted")
                })
                .collect())
        }
    };
    let responses = await_all(bridge, requests, slots, timeout);
    interrupt.release(token);
    responses
}

pub fn call_one(bridge: &McpBridge, request: Value, timeout: Duration) -> Result<Value, McpError> {
    let mut responses = call_batch(bridge, std::slice::from_ref(&request), timeout)?;
    responses.pop().ok_or_else(|| McpError::Protocol {
        reason: "batch of one returned nothing".to_string(),
    })
}

fn expect_result(method: &str, response: Value, timeout: Duration) -> Result<Value, McpError> {
    if wire::is_timeout(&response) {
        return Err(McpError::Timeout {
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        });
    }
    wire::into_result(response)
}

/// Typed operations over one bridge. With an interrupt cell attached, every
/// call can be cancelled by interrupting the owning run.
#[derive(Debug, Clone)]
pub struct McpClient {
    bridge: Arc<McpBridge>,
    timeout: Duration,
    interrupt: Option<Arc<InterruptCell>>,
}

impl McpClient {
    pub fn new(bridge: Arc<McpBridge>, timeout: Duration) -> Self {
        Self {
            bridge,
            timeout,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Arc<InterruptCell>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn bridge(&self) -> &Arc<McpBridge> {
        &self.bridge
    }

    pub fn call_batch(&self, requests: &[Value]) -> Result<Vec<Value>, McpError> {
        self.call_batch_within(requests, self.timeout)
    }

    fn call_batch_within(
        &self,
        requests: &[Value],
        timeout: Duration,
    ) -> Result<Vec<Value>, McpError> {
        match self.interrupt.as_ref() {
            Some(interrupt) => call_batch_interruptible(&self.bridge, requests, timeout, interrupt),
            None => call_batch(&self.bridge, requests, timeout),
        }
    }

    fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, McpError> {
        let request = wire::request(self.bridge.next_request_id(), method, params);
        let mut responses = self.call_batch_within(std::slice::from_ref(&request), timeout)?;
        let response = responses.pop().ok_or_else(|| McpError::Protocol {
            reason: format!("no response slot for `{method}`"),
        })?;
        expect_result(method, response, timeout)
    }

    /// Zero-argument liveness check.
    pub fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        self.request(methods::PING, None, timeout).map(|_| ())
    }

    /// `initialize` followed by `notifications/initialized`. The server's
    /// reply is kept on the bridge cache to decide which lists to fetch.
    pub fn initialize(&self) -> Result<Value, McpError> {
        let params = wire::initialize_params(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let result = self.request(methods::INITIALIZE, Some(params), self.timeout)?;
        self.bridge.cache().set_server_info(result.clone());
        self.bridge.notify(methods::INITIALIZED, None)?;
        self.bridge.log().info(
            "mcp.initialized",
            &format!(
                "server={} protocol={}",
                self.bridge.server(),
                result
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
            ),
        );
        Ok(result)
    }

    /// Every item of one capability kind, following `nextCursor` pages.
    pub fn list(&self, kind: CapabilityKind) -> Result<Vec<Value>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|cursor| json!({"cursor": cursor}));
            let result = self.request(kind.list_method(), params, self.timeout)?;
            if let Some(page) = result.get(kind.result_field()).and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }
            let next = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            match next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    pub fn list_tools(&self) -> Result<Vec<Value>, McpError> {
        self.list(CapabilityKind::Tools)
    }

    pub fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        self.list(CapabilityKind::Prompts)
    }

    pub fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        self.list(CapabilityKind::Resources)
    }

    /// `resources/read` for each uri as one batch. Entries line up with
    /// `uris`: the read `contents`, or `{"error": ...}`.
    pub fn read_resources(&self, uris: &[String]) -> Result<Vec<Value>, McpError> {
        let requests: Vec<Value> = uris
            .iter()
            .map(|uri| {
                wire::request(
                    self.bridge.next_request_id(),
                    methods::RESOURCES_READ,
                    Some(json!({"uri": uri})),
                )
            })
            .collect();
        let responses = self.call_batch(&requests)?;
        Ok(responses
            .into_iter()
            .map(|response| match response.get("error") {
                Some(error) => json!({"error": error}),
                None => response
                    .pointer("/result/contents")
                    .cloned()
                    .unwrap_or(Value::Null),
            })
            .collect())
    }

    /// Re-lists every stale kind and stores the results; listed resources are
    /// read and carry their `contents`. Returns what was refreshed.
    pub fn refresh(&self) -> Result<Vec<CapabilityKind>, McpError> {
        let stale = self.bridge.cache().stale_kinds();
        for kind in &stale {
            let mut items = self.list(*kind)?;
            if *kind == CapabilityKind::Resources {
                self.attach_contents(&mut items)?;
            }
            self.bridge.cache().store(*kind, items);
        }
        Ok(stale)
    }

    fn attach_contents(&self, resources: &mut [Value]) -> Result<(), McpError> {
        let uris: Vec<String> = resources
            .iter()
            .filter_map(|item| item.get("uri").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if uris.is_empty() {
            return Ok(());
        }
        let contents = self.read_resources(&uris)?;
        let mut by_uri: HashMap<String, Value> = uris.into_iter().zip(contents).collect();
        for item in resources.iter_mut() {
            let Some(uri) = item.get("uri").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            if let (Some(read), Some(fields)) = (by_uri.remove(&uri), item.as_object_mut()) {
                fields.insert("contents".to_string(), read);
            }
        }
        Ok(())
    }

    /// Sends the messages of outbound envelopes as one batch and answers each
    /// with an inbound envelope on the same transition, in order.
    pub fn exchange(&self, envelopes: &[Value]) -> Result<Vec<Value>, McpError> {
        let requests = envelopes
            .iter()
            .map(|envelope| {
                wire::envelope_message(envelope)
                    .cloned()
                    .ok_or_else(|| McpError::Protocol {
                        reason: format!("envelope {envelope} carries no message"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let responses = self.call_batch(&requests)?;
        Ok(envelopes
            .iter()
            .zip(responses)
            .map(|(envelope, response)| wire::reply_envelope(envelope, response))
            .collect())
    }

    pub fn tools(&self) -> Vec<Value> {
        self.bridge.cache().items(CapabilityKind::Tools).to_vec()
    }

    /// `tools/call` requests for model-issued calls of the form
    /// `{"name": ..., "arguments": {...}}`.
    pub fn tool_call_requests(&self, calls: &[Value]) -> Vec<Value> {
        calls
            .iter()
            .map(|call| {
                let name = call.get("name").cloned().unwrap_or(Value::Null);
                let arguments = call.get("arguments").cloned().unwrap_or_else(|| json!({}));
                wire::request(
                    self.bridge.next_request_id(),
                    methods::TOOLS_CALL,
                    Some(json!({"name": name, "arguments": arguments})),
                )
            })
            .collect()
    }

    /// Executes model-issued tool calls as one batch. Results pair each call
    /// with its response, in call order.
    pub fn call_tools(&self, calls: &[Value]) -> Result<Vec<Value>, McpError> {
        let requests = self.tool_call_requests(calls);
        let responses = self.call_batch(&requests)?;
        Ok(tool_results(calls, responses))
    }
}

/// Pairs each tool call with its response: `{name, result}` or `{name, error}`.
pub fn tool_results(calls: &[Value], responses: impl IntoIterator<Item = Value>) -> Vec<Value> {
    calls
        .iter()
        .zip(responses)
        .map(|(call, response)| {
            let name = call.get("name").cloned().unwrap_or(Value::Null);
            match response.get("error") {
                Some(error) => json!({"name": name, "error": error}),
                None => json!({
                    "name": name,
                    "result": response.get("result").cloned().unwrap_or(Value::Null),
                }),
            }
        })
        .collect()
}
