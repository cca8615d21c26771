use super::cache::{CapabilityCache, CapabilityKind};
use super::error::{io_error, McpError};
use super::transport::spawn_stdio;
use super::wire::{self, methods, Inbound};
use crate::config::McpServerConfig;
use crate::shared::logging::LogSink;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingEntry {
    id: Value,
    slot: SyncSender<Value>,
}

struct Shared {
    server: String,
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    cache: Mutex<CapabilityCache>,
    closed: AtomicBool,
    log: LogSink,
}

impl Shared {
    fn write_line(&self, message: &Value) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed {
                server: self.server.clone(),
            });
        }
        let mut line = serde_json::to_string(message).map_err(|err| McpError::Protocol {
            reason: err.to_string(),
        })?;
        line.push('\n');
        let mut writer = lock(&self.writer);
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|err| io_error(format!("mcp server `{}` stdin", self.server), err))
    }

    /// Delivers `response` to the slot registered under `key`, if any.
    fn resolve(&self, key: &str, response: Value) -> bool {
        let entry = lock(&self.pending).remove(key);
        match entry {
            Some(entry) => {
                let _ = entry.slot.try_send(response);
                true
            }
            None => false,
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<PendingEntry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.slot.try_send(wire::error_response(&entry.id, reason));
        }
    }
}

/// Single-assignment future for one request id.
pub struct ResponseSlot {
    key: String,
    receiver: Receiver<Value>,
}

impl ResponseSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn wait_until(&self, deadline: Instant) -> Option<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.receiver.recv_timeout(remaining).ok()
    }

    pub fn try_take(&self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

/// One live connection to an MCP server. A reader thread routes responses to
/// their registered slots, answers server pings and forwards notifications.
pub struct McpBridge {
    shared: Arc<Shared>,
    notifications: Mutex<Receiver<Value>>,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for McpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBridge")
            .field("server", &self.shared.server)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl McpBridge {
    pub fn spawn(server: &str, config: &McpServerConfig, log: LogSink) -> Result<Self, McpError> {
        let transport = spawn_stdio(server, config, &log)?;
        Self::from_streams(
            server,
            transport.stdout,
            transport.stdin,
            transport.closer,
            log,
        )
    }

    /// Bridge over any byte streams, e.g. one end of a socket pair. `closer`
    /// runs once when the bridge closes and must make `reader` hit EOF.
    pub fn from_streams(
        server: &str,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        closer: impl FnOnce() + Send + 'static,
        log: LogSink,
    ) -> Result<Self, McpError> {
        let shared = Arc::new(Shared {
            server: server.to_string(),
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            cache: Mutex::new(CapabilityCache::new()),
            closed: AtomicBool::new(false),
            log,
        });
        let (notify_tx, notify_rx) = mpsc::channel();
        let reader_shared = shared.clone();
        thread::Builder::new()
            .name(format!("mcp-{server}-reader"))
            .spawn(move || read_loop(reader_shared, reader, notify_tx))
            .map_err(|err| io_error(format!("mcp server `{server}` reader"), err))?;

        Ok(Self {
            shared,
            notifications: Mutex::new(notify_rx),
            closer: Mutex::new(Some(Box::new(closer))),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    pub fn log(&self) -> &LogSink {
        &self.shared.log
    }

    pub fn next_request_id(&self) -> Value {
        json!(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers `id` before its request is written so an early response has
    /// somewhere to land.
    pub fn register(&self, id: &Value) -> Result<ResponseSlot, McpError> {
        let key = wire::id_key(id).ok_or_else(|| McpError::MissingRequestId {
            request: id.to_string(),
        })?;
        if self.is_closed() {
            return Err(McpError::Closed {
                server: self.shared.server.clone(),
            });
        }
        let mut pending = lock(&self.shared.pending);
        if pending.contains_key(&key) {
            return Err(McpError::DuplicateRequestId { id: key });
        }
        let (slot, receiver) = mpsc::sync_channel(1);
        pending.insert(
            key.clone(),
            PendingEntry {
                id: id.clone(),
                slot,
            },
        );
        Ok(ResponseSlot { key, receiver })
    }

    /// Removes a pending id. Returns `false` when a response already claimed it.
    pub fn unregister(&self, key: &str) -> bool {
        lock(&self.shared.pending).remove(key).is_some()
    }

    /// Resolves the listed ids with an error response built from `reason`.
    pub fn cancel(&self, keys: &[String], reason: &str) {
        for key in keys {
            let entry = lock(&self.shared.pending).remove(key);
            if let Some(entry) = entry {
                let _ = self.notify(
                    "notifications/cancelled",
                    Some(json!({"requestId": entry.id, "reason": reason})),
                );
                let _ = entry.slot.try_send(wire::error_response(&entry.id, reason));
            }
        }
    }

    pub fn send(&self, message: &Value) -> Result<(), McpError> {
        self.shared.write_line(message)
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.shared.write_line(&wire::notification(method, params))
    }

    pub fn recv_notification(&self, timeout: Duration) -> Option<Value> {
        match lock(&self.notifications).recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv_notification(&self) -> Option<Value> {
        lock(&self.notifications).try_recv().ok()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn cache(&self) -> MutexGuard<'_, CapabilityCache> {
        lock(&self.shared.cache)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Tears the connection down. Pending ids resolve with an error response.
    /// Returns `true` only for the call that actually closed the bridge.
    pub fn close(&self) -> bool {
        let closer = lock(&self.closer).take();
        let Some(closer) = closer else {
            return false;
        };
        self.shared.closed.store(true, Ordering::SeqCst);
        closer();
        self.shared.fail_all_pending("bridge closed");
        self.shared
            .log
            .info("mcp.close", &format!("server={}", self.shared.server));
        true
    }
}

impl Drop for McpBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(shared: Arc<Shared>, reader: impl Read, notifications: Sender<Value>) {
    let reader = BufReader::new(reader);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                shared.log.warn(
                    "mcp.read_failed",
                    &format!("server={} error={err}", shared.server),
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                shared.log.warn(
                    "mcp.invalid_json",
                    &format!("server={} error={err}", shared.server),
                );
                continue;
            }
        };
        match wire::classify(message) {
            Inbound::Response { key, message } => {
                if !shared.resolve(&key, message) {
                    shared.log.warn(
                        "mcp.unmatched_response",
                        &format!("server={} id={key}", shared.server),
                    );
                }
            }
            Inbound::Request { id, method } => {
                let reply = if method == methods::PING {
                    wire::result_response(&id, json!({}))
                } else {
                    json!({
                        "jsonrpc": wire::JSONRPC_VERSION,
                        "id": id,
                        "error": {"code": -32601, "message": format!("method `{method}` not supported")}
                    })
                };
                let _ = shared.write_line(&reply);
            }
            Inbound::Notification { method, message } => {
                if let Some(kind) = CapabilityKind::from_list_changed(&method) {
                    lock(&shared.cache).invalidate(kind);
                }
                let _ = notifications.send(message);
            }
            Inbound::Invalid { reason } => {
                shared.log.warn(
                    "mcp.invalid_message",
                    &format!("server={} reason={reason}", shared.server),
                );
            }
        }
    }

    let first_failure = !shared.closed.swap(true, Ordering::SeqCst);
    shared.fail_all_pending("transport closed");
    if first_failure {
        shared.log.warn(
            "mcp.transport_closed",
            &format!("server={}", shared.server),
        );
    }
}
