//! MCP (JSON-RPC 2.0) tool service and its inverted-WebSocket transport.
//!
//! The reasoning engine runs inside a sandbox whose loopback it can reach,
//! while the orchestrator cannot accept unsolicited inbound connections.  So
//! the transport is inverted: a small bridge process inside the sandbox
//! terminates the engine's MCP HTTP calls and relays each one over a single
//! WebSocket the orchestrator dialed in.  The engine never connects to the
//! orchestrator directly.
//!
//! Modules:
//! - [`rpc`] — JSON-RPC 2.0 framing.
//! - [`service`] — the MCP method surface over a [`minder_tools::ToolRegistry`].
//! - [`bridge`] — the sandbox-side process (MCP HTTP + WS-UPLINK acceptor).
//! - [`uplink`] — the orchestrator-side WebSocket client answering frames.

pub mod bridge;
pub mod rpc;
pub mod service;
pub mod uplink;

use serde::{Deserialize, Serialize};

/// Frame relayed bridge → orchestrator for each HTTP request the bridge
/// receives.  `request` is the untouched JSON-RPC body; `session_id` carries
/// the `Mcp-Session-Id` header when the engine sent one; `delete` marks a
/// best-effort session-terminate (HTTP DELETE).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkFrame {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub delete: bool,
}

/// Frame relayed orchestrator → bridge.  `response = None` means the request
/// was notification-only and produces an empty HTTP 202.  `session_id` is
/// echoed into the `Mcp-Session-Id` response header by the bridge, which
/// itself stays stateless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
