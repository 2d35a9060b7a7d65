//! Conversation-window tools.
//!
//! `save_conversation_summary` is the compaction mechanism: the summary row
//! and the deletion of the messages it absorbs commit in one store
//! transaction, so no crash can leave a summary without its prune (or a
//! prune without its summary).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use minder_memory::{Store, Summary, with_retry};

use crate::memory_tools::format_ts;
use crate::{Tool, ToolOutput, ToolSpec, now_ms, schema_for};

/// Share of the buffer (oldest first) a summary absorbs.
const ABSORB_NUMERATOR: usize = 7;
const ABSORB_DENOMINATOR: usize = 10;

#[derive(Debug, Deserialize, JsonSchema)]
struct SaveConversationSummaryArgs {
    /// Narrative summary of the conversation so far.
    summary: String,
    notes: Option<String>,
    key_decisions: Option<Vec<String>>,
    open_threads: Option<Vec<String>>,
    learned_patterns: Option<Vec<String>>,
}

pub struct SaveConversationSummaryTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for SaveConversationSummaryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_conversation_summary".to_string(),
            description: "Write a summary and prune the oldest 70% of the conversation buffer it absorbs.".to_string(),
            input_schema: schema_for::<SaveConversationSummaryArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: SaveConversationSummaryArgs = serde_json::from_value(args.clone())?;

        let messages = self.store.recent_messages(usize::MAX)?;
        let absorb = messages.len() * ABSORB_NUMERATOR / ABSORB_DENOMINATOR;
        let absorbed = &messages[..absorb];

        let summary = Summary {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            content: args.summary,
            notes: args.notes,
            key_decisions: args.key_decisions.unwrap_or_default(),
            open_threads: args.open_threads.unwrap_or_default(),
            learned_patterns: args.learned_patterns.unwrap_or_default(),
            from_timestamp: absorbed.first().map(|m| m.timestamp).unwrap_or(0),
            to_timestamp: absorbed.last().map(|m| m.timestamp).unwrap_or(0),
            message_count: absorbed.len(),
        };

        let store = self.store.clone();
        let saved = summary.clone();
        let pruned = with_retry(move || store.save_summary(&saved)).await?;
        Ok(ToolOutput::text(format!(
            "Summary saved; {pruned} message(s) absorbed."
        )))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetRecentSummariesArgs {
    /// How many summaries to return (default 3, newest first).
    count: Option<usize>,
}

pub struct GetRecentSummariesTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for GetRecentSummariesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_recent_summaries".to_string(),
            description: "Read the most recent conversation summaries.".to_string(),
            input_schema: schema_for::<GetRecentSummariesArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: GetRecentSummariesArgs = serde_json::from_value(args.clone())?;
        let summaries = self.store.recent_summaries(args.count.unwrap_or(3))?;
        if summaries.is_empty() {
            return Ok(ToolOutput::text("No summaries yet."));
        }

        let blocks: Vec<String> = summaries
            .iter()
            .map(|s| {
                let mut block = format!(
                    "## {} ({} messages)\n{}",
                    format_ts(s.timestamp),
                    s.message_count,
                    s.content
                );
                if let Some(notes) = &s.notes {
                    block.push_str(&format!("\nNotes: {notes}"));
                }
                if !s.key_decisions.is_empty() {
                    block.push_str(&format!("\nKey decisions: {}", s.key_decisions.join("; ")));
                }
                if !s.open_threads.is_empty() {
                    block.push_str(&format!("\nOpen threads: {}", s.open_threads.join("; ")));
                }
                block
            })
            .collect();
        Ok(ToolOutput::text(blocks.join("\n\n")))
    }
}
