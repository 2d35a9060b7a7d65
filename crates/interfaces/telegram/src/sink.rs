//! Outbound Telegram delivery.

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use minder_tools::ChatSink;

const CHUNK_CHARS: usize = 3500;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramSink {
    client: Client,
    /// `None` without a bot token: sends become logged no-ops.
    base_url: Option<String>,
    owner_chat_id: Option<i64>,
}

impl TelegramSink {
    pub fn new(bot_token: Option<String>, owner_chat_id: Option<i64>) -> Self {
        let base_url = bot_token
            .filter(|t| !t.trim().is_empty())
            .map(|t| format!("https://api.telegram.org/bot{t}"));
        if base_url.is_none() {
            error!("TELEGRAM_BOT_TOKEN missing — outbound messages will be dropped");
        }
        Self {
            client: Client::new(),
            base_url,
            owner_chat_id,
        }
    }

    async fn send_chunk(&self, base_url: &str, chat_id: i64, text: &str) -> Result<()> {
        // First attempt with Markdown; a parse failure (unbalanced markup in
        // model output is common) is retried once with no parse mode.
        match self.call_send(base_url, chat_id, text, Some("Markdown")).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, "sendMessage with parse_mode failed — retrying plain");
                self.call_send(base_url, chat_id, text, None).await
            }
        }
    }

    async fn call_send(
        &self,
        base_url: &str,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()> {
        let body = SendMessageRequest {
            chat_id,
            text,
            parse_mode,
            disable_web_page_preview: true,
        };
        let response = self
            .client
            .post(format!("{base_url}/sendMessage"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse = response.json().await?;
        if !payload.ok {
            let description = payload
                .description
                .unwrap_or_else(|| "telegram sendMessage failed".to_string());
            bail!(description);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send(&self, text: &str, chat_id: Option<i64>) -> Result<()> {
        let Some(base_url) = &self.base_url else {
            error!("dropping outbound message (no bot token)");
            return Ok(());
        };
        let Some(chat_id) = chat_id.or(self.owner_chat_id) else {
            error!("dropping outbound message (no chat id and no owner configured)");
            return Ok(());
        };

        for chunk in chunk_message(text, CHUNK_CHARS) {
            self.send_chunk(base_url, chat_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Split `text` into chunks below Telegram's message limit.
///
/// Works on a shrinking remainder: each round takes a window of at most
/// `max_chars` characters and cuts at the last newline inside it, falling
/// back to a hard cut at the window edge when the window is one long line.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let window = byte_offset_of_char(rest, max_chars);
        if window >= rest.len() {
            chunks.push(rest.to_string());
            break;
        }
        let cut = match rest[..window].rfind('\n') {
            Some(newline) => newline + 1,
            None => window,
        };
        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start_matches('\n');
    }

    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

/// Byte offset of the `n`-th character, or the string's length when it has
/// fewer than `n` characters.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(offset, _)| offset).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_splits_on_lines() {
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_message(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn single_long_line_is_hard_cut_at_the_window() {
        let text = "x".repeat(250);
        let chunks = chunk_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 100);
        assert_eq!(chunks[2].chars().count(), 50);
    }

    #[test]
    fn every_chunk_respects_the_limit() {
        let text = (0..50).map(|i| format!("line number {i}")).collect::<Vec<_>>().join("\n");
        for chunk in chunk_message(&text, 100) {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[tokio::test]
    async fn missing_token_is_a_silent_no_op() {
        let sink = TelegramSink::new(None, Some(1));
        // Must not error and must not attempt any network call.
        sink.send("hello", None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_chat_id_everywhere_is_a_logged_drop() {
        let sink = TelegramSink::new(Some("token".to_string()), None);
        sink.send("hello", None).await.unwrap();
    }
}
