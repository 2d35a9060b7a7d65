//! Communication tools.
//!
//! The concrete Telegram sender lives in the telegram interface crate; tools
//! only see the [`ChatSink`] seam so they stay testable without a network.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::{Tool, ToolOutput, ToolSpec, schema_for};

/// Outbound chat delivery.  `chat_id = None` means the configured owner.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, text: &str, chat_id: Option<i64>) -> Result<()>;
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SendTelegramArgs {
    message: String,
    /// Target chat id; defaults to the owner's chat.
    chat_id: Option<i64>,
}

pub struct SendTelegramTool {
    pub sink: Arc<dyn ChatSink>,
}

#[async_trait]
impl Tool for SendTelegramTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "send_telegram".to_string(),
            description: "Send a Telegram message. Required for alarm/ambient turns — replies to those are not delivered automatically.".to_string(),
            input_schema: schema_for::<SendTelegramArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: SendTelegramArgs = serde_json::from_value(args.clone())?;
        self.sink.send(&args.message, args.chat_id).await?;
        Ok(ToolOutput::text("Message sent."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Option<i64>)>>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send(&self, text: &str, chat_id: Option<i64>) -> Result<()> {
            self.sent.lock().unwrap().push((text.to_string(), chat_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sends_through_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let tool = SendTelegramTool { sink: sink.clone() };

        let output = tool
            .run(&serde_json::json!({ "message": "drink water", "chat_id": 7 }))
            .await
            .unwrap();
        assert!(!output.is_error);
        assert_eq!(
            sink.sent.lock().unwrap().as_slice(),
            &[("drink water".to_string(), Some(7))]
        );
    }

    #[tokio::test]
    async fn chat_id_defaults_to_owner() {
        let sink = Arc::new(RecordingSink::default());
        let tool = SendTelegramTool { sink: sink.clone() };

        tool.run(&serde_json::json!({ "message": "hi" })).await.unwrap();
        assert_eq!(sink.sent.lock().unwrap()[0].1, None);
    }
}
