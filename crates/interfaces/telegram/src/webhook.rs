//! Inbound webhook: authenticate, filter, normalise, enqueue.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};

use minder_memory::{MessageSource, Store};
use minder_runtime::Trigger;
use minder_tools::ChatSink;

/// Header Telegram attaches when the webhook was registered with a secret
/// token.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub struct WebhookState {
    /// Shared webhook secret; `None` disables the check (local development).
    pub secret: Option<String>,
    /// Static allow-list of Telegram user ids.  Empty list means nobody.
    pub allowed_user_ids: Vec<i64>,
    pub triggers: mpsc::Sender<Trigger>,
    pub store: Arc<Store>,
    pub sink: Arc<dyn ChatSink>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_update))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    from: Option<FromUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct FromUser {
    id: i64,
}

async fn handle_update(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Some(expected) = &state.secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !secret_matches(expected, provided) {
            warn!("webhook secret mismatch");
            return StatusCode::UNAUTHORIZED;
        }
    }

    // From here on the platform always gets a 200 — anything else is
    // redelivered, and a replayed update would run the same turn twice.
    let update: Update = match serde_json::from_str(&body) {
        Ok(u) => u,
        Err(err) => {
            warn!(%err, "unparseable webhook body");
            return StatusCode::OK;
        }
    };
    let Some(message) = update.message else {
        return StatusCode::OK;
    };
    let Some(text) = message.text else {
        return StatusCode::OK;
    };

    let user_id = message.from.map(|f| f.id);
    let allowed = user_id.is_some_and(|id| state.allowed_user_ids.contains(&id));
    if !allowed {
        warn!(?user_id, "ignoring update from disallowed user");
        return StatusCode::OK;
    }

    let chat_id = message.chat.id;
    if text.trim() == "/clear" {
        match state.store.clear_conversation() {
            Ok(removed) => {
                info!(removed, "conversation cleared");
                let _ = state
                    .sink
                    .send(&format!("Conversation cleared ({removed} messages)."), Some(chat_id))
                    .await;
            }
            Err(err) => {
                warn!(%err, "clear failed");
                let _ = state.sink.send("Could not clear the conversation.", Some(chat_id)).await;
            }
        }
        return StatusCode::OK;
    }

    let trigger = Trigger::Message {
        text: text.trim().to_string(),
        source: MessageSource::Telegram,
        chat_id: Some(chat_id),
    };
    if state.triggers.send(trigger).await.is_err() {
        warn!("trigger queue closed — dropping update");
    }
    StatusCode::OK
}

/// Constant-time comparison of the shared secret.
fn secret_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send(&self, text: &str, _chat_id: Option<i64>) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        sink: Arc<RecordingSink>,
        rx: mpsc::Receiver<Trigger>,
        router: Router,
    }

    fn fixture(secret: Option<&str>, allowed: Vec<i64>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.redb")).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(WebhookState {
            secret: secret.map(String::from),
            allowed_user_ids: allowed,
            triggers: tx,
            store: store.clone(),
            sink: sink.clone(),
        });
        Fixture {
            _dir: dir,
            store,
            sink,
            rx,
            router: router(state),
        }
    }

    fn update_body(user_id: i64, text: &str) -> String {
        serde_json::json!({
            "update_id": 1,
            "message": {
                "chat": { "id": 42 },
                "from": { "id": user_id },
                "text": text,
            },
        })
        .to_string()
    }

    async fn post(router: Router, secret: Option<&str>, body: String) -> StatusCode {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            request = request.header(SECRET_HEADER, secret);
        }
        let response = router
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn wrong_secret_is_401() {
        let fixture = fixture(Some("s3cret"), vec![7]);
        let status = post(fixture.router, Some("wrong"), update_body(7, "hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_secret_header_is_401() {
        let fixture = fixture(Some("s3cret"), vec![7]);
        let status = post(fixture.router, None, update_body(7, "hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn allowed_user_enqueues_a_trigger() {
        let mut fixture = fixture(Some("s3cret"), vec![7]);
        let status = post(fixture.router, Some("s3cret"), update_body(7, "hello agent")).await;
        assert_eq!(status, StatusCode::OK);

        match fixture.rx.try_recv().unwrap() {
            Trigger::Message { text, chat_id, .. } => {
                assert_eq!(text, "hello agent");
                assert_eq!(chat_id, Some(42));
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disallowed_user_is_silently_ignored_with_200() {
        let mut fixture = fixture(Some("s3cret"), vec![7]);
        let status = post(fixture.router, Some("s3cret"), update_body(999, "hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fixture.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clear_command_resets_and_replies() {
        use minder_memory::{Message, Role, TriggerKind};
        let mut fixture = fixture(Some("s3cret"), vec![7]);
        fixture
            .store
            .append_message(&Message {
                id: uuid::Uuid::new_v4(),
                role: Role::User,
                content: "old".to_string(),
                timestamp: 1,
                trigger: TriggerKind::Message,
                source: None,
            })
            .unwrap();

        let status = post(fixture.router, Some("s3cret"), update_body(7, "/clear")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fixture.store.recent_messages(10).unwrap().is_empty());
        assert!(fixture.sink.sent.lock().unwrap()[0].contains("cleared"));
        // A /clear is handled locally, never forwarded as a trigger.
        assert!(fixture.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_body_still_returns_200() {
        let fixture = fixture(Some("s3cret"), vec![7]);
        let status = post(fixture.router, Some("s3cret"), "not json".to_string()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn secret_compare_rejects_near_misses() {
        assert!(secret_matches("abc", "abc"));
        assert!(!secret_matches("abc", "abd"));
        assert!(!secret_matches("abc", "ab"));
        assert!(!secret_matches("abc", ""));
    }
}
