//! The MCP method surface: session lifecycle, tool discovery, tool calls,
//! and batch handling, independent of any transport.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use minder_tools::{DispatchError, ToolRegistry};

use crate::rpc::{self, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcRequest};

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SERVER_NAME: &str = "minder";

/// Result of handling one HTTP body (single request or batch).
#[derive(Debug)]
pub struct Handled {
    /// The JSON-RPC response body; `None` when only notifications were
    /// received (HTTP 202 with no body).
    pub body: Option<Value>,
    /// Session id allocated by an `initialize` in this body, to be echoed in
    /// the `Mcp-Session-Id` header.
    pub new_session: Option<String>,
}

pub struct McpService {
    registry: Arc<ToolRegistry>,
    sessions: Mutex<HashSet<String>>,
}

impl McpService {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Handle a raw HTTP body: a single JSON-RPC request or a batch array.
    pub async fn handle_body(&self, body: &Value) -> Handled {
        match body {
            Value::Array(requests) => {
                if requests.is_empty() {
                    return Handled {
                        body: Some(rpc::error_response(
                            Value::Null,
                            INVALID_REQUEST,
                            "empty batch",
                        )),
                        new_session: None,
                    };
                }
                let mut responses = Vec::new();
                let mut new_session = None;
                for raw in requests {
                    let (reply, session) = self.handle_raw(raw).await;
                    if let Some(reply) = reply {
                        responses.push(reply);
                    }
                    new_session = new_session.or(session);
                }
                Handled {
                    body: if responses.is_empty() {
                        None
                    } else {
                        Some(Value::Array(responses))
                    },
                    new_session,
                }
            }
            _ => {
                let (reply, new_session) = self.handle_raw(body).await;
                Handled {
                    body: reply,
                    new_session,
                }
            }
        }
    }

    /// Handle one element: parse, dispatch, build the response (or nothing
    /// for notifications).
    async fn handle_raw(&self, raw: &Value) -> (Option<Value>, Option<String>) {
        let request: RpcRequest = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(err) => {
                return (
                    Some(rpc::error_response(
                        rpc::id_of(raw),
                        PARSE_ERROR,
                        &format!("malformed request: {err}"),
                    )),
                    None,
                );
            }
        };

        let is_notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);
        debug!(method = %request.method, notification = is_notification, "mcp request");

        let (result, new_session) = match request.method.as_str() {
            "initialize" => {
                let session = self.open_session().await;
                (
                    Ok(serde_json::json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "serverInfo": {
                            "name": SERVER_NAME,
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                        "capabilities": { "tools": {} },
                    })),
                    Some(session),
                )
            }
            "initialized" | "notifications/initialized" => (Ok(Value::Null), None),
            "ping" => (Ok(serde_json::json!({})), None),
            "tools/list" => (Ok(self.tools_list()), None),
            "tools/call" => (self.tools_call(&request.params).await, None),
            other => (
                Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
                None,
            ),
        };

        if is_notification {
            return (None, new_session);
        }
        let reply = match result {
            Ok(value) => rpc::response(id, value),
            Err((code, message)) => rpc::error_response(id, code, &message),
        };
        (Some(reply), new_session)
    }

    fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list_specs()
            .into_iter()
            .map(|spec| {
                serde_json::json!({
                    "name": spec.name,
                    "description": spec.description,
                    "inputSchema": spec.input_schema,
                })
            })
            .collect();
        serde_json::json!({ "tools": tools })
    }

    async fn tools_call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or((INVALID_PARAMS, "tools/call requires a name".to_string()))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        match self.registry.call_tool(name, &arguments).await {
            Ok(output) => Ok(serde_json::to_value(output)
                .unwrap_or_else(|_| serde_json::json!({ "content": [], "isError": true }))),
            Err(DispatchError::UnknownTool(name)) => {
                Err((METHOD_NOT_FOUND, format!("unknown tool: {name}")))
            }
        }
    }

    async fn open_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(id.clone());
        info!(session = %id, "mcp session opened");
        id
    }

    /// Best-effort session termination (HTTP DELETE).  Unknown ids succeed —
    /// the bridge already promised 204.
    pub async fn end_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        if removed {
            info!(session = %id, "mcp session ended");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use minder_tools::{Tool, ToolOutput, ToolSpec};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echoes".to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"],
                }),
            }
        }
        async fn run(&self, args: &Value) -> Result<ToolOutput> {
            let text = args["text"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(text.to_string()))
        }
    }

    fn service() -> McpService {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));
        McpService::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn initialize_allocates_a_session() {
        let service = service();
        let handled = service
            .handle_body(&serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {},
            }))
            .await;

        let body = handled.body.unwrap();
        assert_eq!(body["result"]["protocolVersion"], serde_json::json!(PROTOCOL_VERSION));
        assert!(handled.new_session.is_some());
        assert_eq!(service.session_count().await, 1);
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let handled = service()
            .handle_body(&serde_json::json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" }))
            .await;
        assert_eq!(handled.body.unwrap()["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn tools_list_advertises_input_schema() {
        let handled = service()
            .handle_body(&serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
            .await;
        let body = handled.body.unwrap();
        let tools = body["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], serde_json::json!("echo"));
        assert_eq!(tools[0]["inputSchema"]["required"][0], serde_json::json!("text"));
    }

    #[tokio::test]
    async fn tools_call_round_trips() {
        let handled = service()
            .handle_body(&serde_json::json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": { "name": "echo", "arguments": { "text": "hi" } },
            }))
            .await;
        let body = handled.body.unwrap();
        assert_eq!(body["result"]["content"][0]["text"], serde_json::json!("hi"));
        assert_eq!(body["result"]["isError"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_method_not_found_code() {
        let handled = service()
            .handle_body(&serde_json::json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "missing", "arguments": {} },
            }))
            .await;
        let body = handled.body.unwrap();
        assert_eq!(body["error"]["code"], serde_json::json!(-32601));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let handled = service()
            .handle_body(&serde_json::json!({ "jsonrpc": "2.0", "id": 5, "method": "bogus" }))
            .await;
        assert_eq!(handled.body.unwrap()["error"]["code"], serde_json::json!(-32601));
    }

    #[tokio::test]
    async fn batch_tracks_ids_and_drops_notifications() {
        let handled = service()
            .handle_body(&serde_json::json!([
                { "jsonrpc": "2.0", "id": 10, "method": "ping" },
                { "jsonrpc": "2.0", "method": "initialized" },
                { "jsonrpc": "2.0", "id": 11, "method": "tools/list" },
            ]))
            .await;
        let body = handled.body.unwrap();
        let responses = body.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], serde_json::json!(10));
        assert_eq!(responses[1]["id"], serde_json::json!(11));
    }

    #[tokio::test]
    async fn all_notification_batch_produces_no_body() {
        let handled = service()
            .handle_body(&serde_json::json!([
                { "jsonrpc": "2.0", "method": "initialized" },
            ]))
            .await;
        assert!(handled.body.is_none());
    }

    #[tokio::test]
    async fn end_session_is_idempotent() {
        let service = service();
        let handled = service
            .handle_body(&serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {},
            }))
            .await;
        let session = handled.new_session.unwrap();
        assert!(service.end_session(&session).await);
        assert!(!service.end_session(&session).await);
    }
}
