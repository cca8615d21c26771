//! Model Context Protocol plumbing: JSON-RPC framing, the per-server bridge,
//! batched calls and the protocol FSM.

pub mod bridge;
pub mod cache;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod wire;

pub use bridge::{McpBridge, ResponseSlot};
pub use cache::{CapabilityCache, CapabilityKind};
pub use client::{call_batch, call_batch_interruptible, call_one, tool_results, McpClient};
pub use error::McpError;
pub use protocol::{
    protocol_actions, protocol_definition, protocol_request, register_protocol_actions,
    start_protocol, ProtocolAction,
};
pub use registry::BridgeRegistry;
