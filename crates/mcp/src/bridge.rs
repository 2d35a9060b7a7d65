//! The sandbox-side bridge process.
//!
//! Two listeners:
//! - **HTTP-MCP** (loopback): the reasoning engine's standard MCP HTTP
//!   endpoint.  Each request is wrapped in an [`UplinkFrame`] and relayed
//!   over the uplink; the HTTP response is whatever comes back.
//! - **WS-UPLINK**: accepts the single WebSocket the orchestrator dials in.
//!   A new connection replaces the previous one.
//!
//! The bridge holds no MCP state — session ids ride the frames untouched.
//! Without an uplink the MCP side answers 503 until one appears.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::{self, PARSE_ERROR, REQUEST_TIMEOUT};
use crate::{ReplyFrame, UplinkFrame};

pub const MCP_SESSION_HEADER: &str = "mcp-session-id";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct UplinkSlot {
    /// Outgoing frames to the current orchestrator connection.
    tx: mpsc::Sender<String>,
    /// Distinguishes connections so a stale reader can't clear its successor.
    generation: u64,
}

pub struct BridgeState {
    request_timeout: Duration,
    uplink: Mutex<Option<UplinkSlot>>,
    next_generation: std::sync::atomic::AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyFrame>>>,
}

impl BridgeState {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            request_timeout,
            uplink: Mutex::new(None),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    async fn uplink_tx(&self) -> Option<mpsc::Sender<String>> {
        self.uplink.lock().await.as_ref().map(|slot| slot.tx.clone())
    }

    async fn resolve(&self, reply: ReplyFrame) {
        let waiter = self.pending.lock().await.remove(&reply.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id = %reply.request_id, "reply for unknown request (likely a fire-and-forget delete)"),
        }
    }

    async fn reject_all_pending(&self, reason: &str) {
        let drained: Vec<(String, oneshot::Sender<ReplyFrame>)> =
            self.pending.lock().await.drain().collect();
        for (request_id, tx) in drained {
            let _ = tx.send(ReplyFrame {
                request_id,
                response: None,
                session_id: None,
                error: Some(reason.to_string()),
            });
        }
    }
}

// ── MCP HTTP surface ─────────────────────────────────────────────────────────

pub fn mcp_router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/", any(mcp_entry))
        .route("/mcp", any(mcp_entry))
        .route("/health", get(health))
        .with_state(state)
}

async fn mcp_entry(
    State(state): State<Arc<BridgeState>>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    if method == axum::http::Method::POST {
        relay_post(state, headers, body).await
    } else if method == axum::http::Method::DELETE {
        relay_delete(state, headers).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn relay_post(state: Arc<BridgeState>, headers: HeaderMap, body: String) -> Response {
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(err) => {
            let reply = rpc::error_response(
                Value::Null,
                PARSE_ERROR,
                &format!("invalid JSON body: {err}"),
            );
            return json_response(StatusCode::OK, &reply, None);
        }
    };

    let request_id = Uuid::new_v4().to_string();
    let frame = UplinkFrame {
        request_id: request_id.clone(),
        request: Some(parsed.clone()),
        session_id: header_value(&headers, MCP_SESSION_HEADER),
        delete: false,
    };

    let Some(tx) = state.uplink_tx().await else {
        return service_unavailable();
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    state.pending.lock().await.insert(request_id.clone(), reply_tx);

    let serialized = match serde_json::to_string(&frame) {
        Ok(s) => s,
        Err(err) => {
            state.pending.lock().await.remove(&request_id);
            warn!(%err, "failed to serialise uplink frame");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if tx.send(serialized).await.is_err() {
        state.pending.lock().await.remove(&request_id);
        return service_unavailable();
    }

    match tokio::time::timeout(state.request_timeout, reply_rx).await {
        Err(_) => {
            state.pending.lock().await.remove(&request_id);
            let reply =
                rpc::error_response(rpc::id_of(&parsed), REQUEST_TIMEOUT, "Request timeout");
            json_response(StatusCode::OK, &reply, None)
        }
        Ok(Err(_)) => {
            // The resolver hung up without answering; treat like a dropped
            // uplink.
            let reply =
                rpc::error_response(rpc::id_of(&parsed), REQUEST_TIMEOUT, "DO connection closed");
            json_response(StatusCode::OK, &reply, None)
        }
        Ok(Ok(reply)) => {
            if let Some(error) = reply.error {
                let body = rpc::error_response(rpc::id_of(&parsed), REQUEST_TIMEOUT, &error);
                return json_response(StatusCode::OK, &body, None);
            }
            match reply.response {
                // Notification-only body: nothing to return.
                None => StatusCode::ACCEPTED.into_response(),
                Some(value) => json_response(StatusCode::OK, &value, reply.session_id.as_deref()),
            }
        }
    }
}

/// Best-effort session terminate.  The frame is fire-and-forget; 204 either
/// way, matching the surface contract.
async fn relay_delete(state: Arc<BridgeState>, headers: HeaderMap) -> Response {
    if let Some(tx) = state.uplink_tx().await {
        let frame = UplinkFrame {
            request_id: Uuid::new_v4().to_string(),
            request: None,
            session_id: header_value(&headers, MCP_SESSION_HEADER),
            delete: true,
        };
        if let Ok(serialized) = serde_json::to_string(&frame) {
            let _ = tx.send(serialized).await;
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn health(State(state): State<Arc<BridgeState>>) -> Response {
    let connected = state.uplink.lock().await.is_some();
    let body = serde_json::json!({ "status": "ok", "doConnected": connected });
    json_response(StatusCode::OK, &body, None)
}

fn service_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "MCP uplink not connected").into_response()
}

fn json_response(status: StatusCode, body: &Value, session_id: Option<&str>) -> Response {
    let mut response = (status, body.to_string()).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    if let Some(session) = session_id {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(MCP_SESSION_HEADER.as_bytes()),
            axum::http::HeaderValue::from_str(session),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

// ── WS-UPLINK surface ────────────────────────────────────────────────────────

pub fn uplink_router(state: Arc<BridgeState>) -> Router {
    Router::new().route("/", get(uplink_handler)).with_state(state)
}

async fn uplink_handler(State(state): State<Arc<BridgeState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_uplink(socket, state))
}

async fn handle_uplink(socket: WebSocket, state: Arc<BridgeState>) {
    let generation = state
        .next_generation
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    {
        let mut slot = state.uplink.lock().await;
        if slot.is_some() {
            info!("new uplink replaces the previous connection");
        } else {
            info!("uplink connected");
        }
        *slot = Some(UplinkSlot { tx: out_tx, generation });
    }

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ReplyFrame>(&text) {
                Ok(reply) => state.resolve(reply).await,
                Err(err) => warn!(%err, "unparseable reply frame from orchestrator"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    let was_current = {
        let mut slot = state.uplink.lock().await;
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            *slot = None;
            info!("uplink disconnected");
            true
        } else {
            // A newer connection already took over; its requests are not ours
            // to reject.
            false
        }
    };
    if was_current {
        state.reject_all_pending("DO connection closed").await;
    }
}

/// Run both bridge listeners until either fails.
pub async fn serve(
    mcp_listener: tokio::net::TcpListener,
    uplink_listener: tokio::net::TcpListener,
    state: Arc<BridgeState>,
) -> anyhow::Result<()> {
    let mcp = axum::serve(mcp_listener, mcp_router(state.clone()));
    let uplink = axum::serve(uplink_listener, uplink_router(state));
    tokio::try_join!(
        async { mcp.await.map_err(anyhow::Error::from) },
        async { uplink.await.map_err(anyhow::Error::from) },
    )?;
    Ok(())
}
