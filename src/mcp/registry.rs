use super::bridge::McpBridge;
use super::McpError;
use crate::config::McpServerConfig;
use crate::shared::logging::LogSink;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Open bridges of one FSM instance, keyed by server id.
#[derive(Debug)]
pub struct BridgeRegistry {
    bridges: Mutex<BTreeMap<String, Arc<McpBridge>>>,
    closed: AtomicBool,
    log: LogSink,
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new(LogSink::disabled())
    }
}

impl BridgeRegistry {
    pub fn new(log: LogSink) -> Self {
        Self {
            bridges: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<McpBridge>>> {
        self.bridges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self, server: &str) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed {
                server: server.to_string(),
            });
        }
        Ok(())
    }

    /// Returns the live bridge for `server`, spawning one when there is none
    /// or the previous one closed.
    pub fn open_or_reuse(
        &self,
        server: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<McpBridge>, McpError> {
        self.ensure_open(server)?;
        let mut bridges = self.lock();
        if let Some(existing) = bridges.get(server) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let bridge = Arc::new(McpBridge::spawn(server, config, self.log.clone())?);
        bridges.insert(server.to_string(), bridge.clone());
        Ok(bridge)
    }

    /// Adopts an already connected bridge, replacing any previous one.
    pub fn insert(&self, bridge: McpBridge) -> Result<Arc<McpBridge>, McpError> {
        self.ensure_open(bridge.server())?;
        let bridge = Arc::new(bridge);
        let replaced = self
            .lock()
            .insert(bridge.server().to_string(), bridge.clone());
        if let Some(old) = replaced {
            old.close();
        }
        Ok(bridge)
    }

    pub fn get(&self, server: &str) -> Option<Arc<McpBridge>> {
        self.lock().get(server).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every bridge. Only the first call does anything.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let bridges: Vec<_> = std::mem::take(&mut *self.lock()).into_values().collect();
        for bridge in bridges {
            bridge.close();
        }
    }
}
