//! Client for the reasoning engine's session API.
//!
//! The engine itself (planning, tool dispatch, streaming) is an external
//! collaborator living in the sandbox; this crate only speaks its HTTP
//! surface: `session.create`, `session.prompt`, `session.get`,
//! `session.abort`, and the SSE event stream.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Network failure, non-success status, or a response we cannot read.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    /// The engine no longer knows the session id we hold.
    #[error("engine session missing")]
    SessionMissing,
}

/// One part of a prompt or of the engine's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            part_type: "text".to_string(),
            text: Some(content.into()),
        }
    }
}

/// Text parts concatenated in order with newlines — the assistant's reply as
/// a single string.
pub fn extract_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter(|p| p.part_type == "text")
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

/// An SSE event from the engine (e.g. `session.idle`).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PromptReply {
    #[serde(default)]
    parts: Vec<Part>,
}

pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
    prompt_timeout: Duration,
}

impl EngineClient {
    pub fn new(base_url: &str, prompt_timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            prompt_timeout,
        })
    }

    pub async fn session_create(
        &self,
        title: &str,
        directory: &str,
    ) -> Result<String, EngineError> {
        let body = serde_json::json!({ "title": title, "directory": directory });
        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        info!(session = %created.id, "engine session created");
        Ok(created.id)
    }

    /// Send a prompt and wait for the engine's reply parts.  This is the
    /// long-haul call — the deadline is the configured prompt timeout, not
    /// the transport default.
    pub async fn session_prompt(
        &self,
        session_id: &str,
        directory: &str,
        model: &str,
        parts: Vec<Part>,
    ) -> Result<Vec<Part>, EngineError> {
        let body = serde_json::json!({
            "directory": directory,
            "body": { "model": model, "parts": parts },
        });
        let response = self
            .client
            .post(format!("{}/session/{session_id}/prompt", self.base_url))
            .timeout(self.prompt_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::SessionMissing);
        }
        let response = response
            .error_for_status()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let reply: PromptReply = response
            .json()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        debug!(session = %session_id, parts = reply.parts.len(), "engine reply received");
        Ok(reply.parts)
    }

    /// `None` when the engine reports no such session.
    pub async fn session_get(&self, session_id: &str) -> Result<Option<Value>, EngineError> {
        let response = self
            .client
            .get(format!("{}/session/{session_id}", self.base_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = response
            .error_for_status()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Best-effort abort.  A failed abort is reported, never fatal — the
    /// caller proceeds either way, and aborting twice is harmless.
    pub async fn session_abort(&self, session_id: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .post(format!("{}/session/{session_id}/abort", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::SessionMissing);
        }
        response
            .error_for_status()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        info!(session = %session_id, "engine session aborted");
        Ok(())
    }

    /// Subscribe to the engine's SSE event stream.  Events arrive on the
    /// returned channel until the stream ends or the receiver is dropped.
    pub async fn subscribe_events(&self) -> Result<mpsc::Receiver<EngineEvent>, EngineError> {
        let response = self
            .client
            .get(format!("{}/event", self.base_url))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(bytes) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                // SSE frames are separated by blank lines; data lines carry
                // the JSON payload.
                while let Some(boundary) = buffer.find("\n\n") {
                    let frame: String = buffer.drain(..boundary + 2).collect();
                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        match serde_json::from_str::<EngineEvent>(data.trim()) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!(%err, "unparseable engine event"),
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_concatenates_in_order() {
        let parts = vec![
            Part::text("first"),
            Part {
                part_type: "tool-use".to_string(),
                text: None,
            },
            Part::text("second"),
        ];
        assert_eq!(extract_text(&parts), "first\nsecond");
    }

    #[test]
    fn extract_text_of_nothing_is_empty() {
        assert_eq!(extract_text(&[]), "");
        let only_tools = vec![Part {
            part_type: "tool-use".to_string(),
            text: None,
        }];
        assert_eq!(extract_text(&only_tools), "");
    }

    #[test]
    fn part_serialises_with_wire_type_field() {
        let value = serde_json::to_value(Part::text("hello")).unwrap();
        assert_eq!(value["type"], serde_json::json!("text"));
        assert_eq!(value["text"], serde_json::json!("hello"));
    }
}
