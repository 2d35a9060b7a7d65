//! Orchestrator-side uplink: dial the bridge's WS-UPLINK port and answer
//! every relayed MCP request by running the local [`McpService`].
//!
//! Exactly one uplink per sandbox instance; connecting again replaces the
//! previous connection (the bridge enforces the same rule on its side).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::service::McpService;
use crate::{ReplyFrame, UplinkFrame};

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("uplink connect failed: {0}")]
    Connect(String),
}

/// A live uplink.  Dropping the handle (or calling [`Uplink::close`]) tears
/// the connection down.
pub struct Uplink {
    pump: JoinHandle<()>,
}

impl Uplink {
    /// Connect to `ws://<sandbox>:<port>/` and start answering frames.
    pub async fn connect(url: &str, service: Arc<McpService>) -> Result<Self, UplinkError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| UplinkError::Connect(e.to_string()))?;
        info!(%url, "mcp uplink established");

        let (mut sink, mut reader) = stream.split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<ReplyFrame>(64);

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = reader.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let frame: UplinkFrame = match serde_json::from_str(&text) {
                                    Ok(f) => f,
                                    Err(err) => {
                                        warn!(%err, "unparseable uplink frame");
                                        continue;
                                    }
                                };
                                // Frames are handled concurrently; the store's
                                // transactional writes keep that safe.
                                let service = service.clone();
                                let reply_tx = reply_tx.clone();
                                tokio::spawn(async move {
                                    let reply = answer(&service, frame).await;
                                    let _ = reply_tx.send(reply).await;
                                });
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%err, "uplink read error");
                                break;
                            }
                            None => {
                                info!("uplink closed by bridge");
                                break;
                            }
                        }
                    }
                    outgoing = reply_rx.recv() => {
                        let Some(reply) = outgoing else { break };
                        let Ok(text) = serde_json::to_string(&reply) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            warn!("uplink write failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { pump })
    }

    pub fn is_alive(&self) -> bool {
        !self.pump.is_finished()
    }

    pub fn close(&self) {
        self.pump.abort();
    }
}

impl Drop for Uplink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn answer(service: &McpService, frame: UplinkFrame) -> ReplyFrame {
    if frame.delete {
        if let Some(session) = frame.session_id.as_deref() {
            service.end_session(session).await;
        }
        return ReplyFrame {
            request_id: frame.request_id,
            response: None,
            session_id: None,
            error: None,
        };
    }

    let Some(request) = frame.request else {
        return ReplyFrame {
            request_id: frame.request_id,
            response: None,
            session_id: None,
            error: Some("frame carried no request".to_string()),
        };
    };

    debug!(request_id = %frame.request_id, "answering relayed mcp request");
    let handled = service.handle_body(&request).await;
    ReplyFrame {
        request_id: frame.request_id,
        response: handled.body,
        session_id: handled.new_session.or(frame.session_id),
        error: None,
    }
}
