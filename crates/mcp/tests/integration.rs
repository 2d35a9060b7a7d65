//! End-to-end bridge/uplink test over real loopback sockets: the "engine"
//! (reqwest) talks MCP HTTP to the bridge, the bridge relays frames over the
//! WebSocket uplink, and the orchestrator-side service answers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use minder_mcp::bridge::{self, BridgeState};
use minder_mcp::service::McpService;
use minder_mcp::uplink::Uplink;
use minder_tools::{Tool, ToolOutput, ToolRegistry, ToolSpec};

struct ShoutTool;

#[async_trait]
impl Tool for ShoutTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shout".to_string(),
            description: "Upper-cases text".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        }
    }
    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let text = args["text"].as_str().unwrap_or_default();
        Ok(ToolOutput::text(text.to_uppercase()))
    }
}

struct Harness {
    mcp_url: String,
    uplink_url: String,
    _uplink: Option<Uplink>,
}

async fn start_bridge() -> Harness {
    let state = BridgeState::new(Duration::from_secs(5));
    let mcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uplink_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mcp_url = format!("http://{}", mcp_listener.local_addr().unwrap());
    let uplink_url = format!("ws://{}", uplink_listener.local_addr().unwrap());

    tokio::spawn(async move {
        let _ = bridge::serve(mcp_listener, uplink_listener, state).await;
    });
    // Give the listeners a beat to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        mcp_url,
        uplink_url,
        _uplink: None,
    }
}

fn service() -> Arc<McpService> {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ShoutTool));
    Arc::new(McpService::new(Arc::new(registry)))
}

#[tokio::test]
async fn without_uplink_mcp_returns_503() {
    let harness = start_bridge().await;
    let client = reqwest::Client::new();
    let response = client
        .post(&harness.mcp_url)
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn full_round_trip_through_the_uplink() {
    let mut harness = start_bridge().await;
    let uplink = Uplink::connect(&harness.uplink_url, service()).await.unwrap();
    harness._uplink = Some(uplink);

    let client = reqwest::Client::new();

    // initialize → session id in the response header.
    let response = client
        .post(&harness.mcp_url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session = response
        .headers()
        .get("mcp-session-id")
        .expect("initialize response carries Mcp-Session-Id")
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["protocolVersion"], serde_json::json!("2025-03-26"));

    // tools/call round trip.
    let response = client
        .post(&harness.mcp_url)
        .header("mcp-session-id", &session)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": { "name": "shout", "arguments": { "text": "quiet" } },
        }))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], serde_json::json!("QUIET"));

    // Notification-only body → 202, no content.
    let response = client
        .post(&harness.mcp_url)
        .json(&serde_json::json!({ "jsonrpc": "2.0", "method": "initialized" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // DELETE → 204 best-effort.
    let response = client
        .delete(&harness.mcp_url)
        .header("mcp-session-id", &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn get_on_mcp_surface_is_405_and_health_reports_uplink() {
    let mut harness = start_bridge().await;
    let client = reqwest::Client::new();

    let response = client.get(&harness.mcp_url).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let health: Value = client
        .get(format!("{}/health", harness.mcp_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["doConnected"], serde_json::json!(false));

    let uplink = Uplink::connect(&harness.uplink_url, service()).await.unwrap();
    harness._uplink = Some(uplink);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let health: Value = client
        .get(format!("{}/health", harness.mcp_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["doConnected"], serde_json::json!(true));
}

#[tokio::test]
async fn dropping_the_uplink_returns_the_bridge_to_503() {
    let harness = start_bridge().await;
    let uplink = Uplink::connect(&harness.uplink_url, service()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(uplink);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(&harness.mcp_url)
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 9, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}
