//! Memory tools: journal, topics, and state files.
//!
//! Journal and topic writes embed best-effort: when the embedder is down the
//! entry is still stored, just invisible to semantic search.  Searches abort
//! instead — a search without a query vector has nothing to rank with.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use minder_memory::{
    Embedder, JournalEntry, Store, search_journal, search_topics, with_retry,
};

use crate::{Tool, ToolOutput, ToolSpec, now_ms, schema_for};

const DEFAULT_SEARCH_LIMIT: usize = 5;

// ── journal_write ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct JournalWriteArgs {
    /// Short topic label for the entry.
    topic: String,
    /// The observation to record.
    content: String,
}

pub struct JournalWriteTool {
    pub store: Arc<Store>,
    pub embedder: Arc<Embedder>,
}

#[async_trait]
impl Tool for JournalWriteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "journal_write".to_string(),
            description: "Append an observation to the journal. Entries are permanent and searchable.".to_string(),
            input_schema: schema_for::<JournalWriteArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: JournalWriteArgs = serde_json::from_value(args.clone())?;

        let embedding = match self.embedder.embed_document(&args.content).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                warn!(%err, "journal entry stored without embedding");
                None
            }
        };

        let entry = JournalEntry {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            topic: args.topic,
            content: args.content,
        };
        let store = self.store.clone();
        with_retry(move || store.write_journal(&entry, embedding.as_deref())).await?;
        Ok(ToolOutput::text("Journal entry saved."))
    }
}

// ── journal_search ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct JournalSearchArgs {
    query: String,
    /// Maximum results to return (default 5).
    limit: Option<usize>,
}

pub struct JournalSearchTool {
    pub store: Arc<Store>,
    pub embedder: Arc<Embedder>,
}

#[async_trait]
impl Tool for JournalSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "journal_search".to_string(),
            description: "Semantic search over journal entries.".to_string(),
            input_schema: schema_for::<JournalSearchArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: JournalSearchArgs = serde_json::from_value(args.clone())?;
        let limit = args.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

        let hits = search_journal(&self.store, &self.embedder, &args.query, limit).await?;
        if hits.is_empty() {
            return Ok(ToolOutput::text("No matching journal entries."));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|hit| {
                format!(
                    "[{:.2}] ({}) {}: {}",
                    hit.score,
                    format_ts(hit.item.timestamp),
                    hit.item.topic,
                    hit.item.content
                )
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

// ── topic_write ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicWriteArgs {
    /// Unique topic name; writing an existing name overwrites its content.
    name: String,
    content: String,
}

pub struct TopicWriteTool {
    pub store: Arc<Store>,
    pub embedder: Arc<Embedder>,
}

#[async_trait]
impl Tool for TopicWriteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "topic_write".to_string(),
            description: "Create or overwrite a named topic. Overwriting re-embeds and keeps the creation time.".to_string(),
            input_schema: schema_for::<TopicWriteArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: TopicWriteArgs = serde_json::from_value(args.clone())?;

        let embedding = match self.embedder.embed_document(&args.content).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                warn!(%err, "topic stored without embedding");
                None
            }
        };

        let store = self.store.clone();
        let name = args.name.clone();
        let topic = with_retry(move || {
            store.upsert_topic(&name, &args.content, embedding.as_deref(), now_ms())
        })
        .await?;
        Ok(ToolOutput::text(format!("Topic '{}' saved.", topic.name)))
    }
}

// ── topic_get ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicGetArgs {
    name: String,
}

pub struct TopicGetTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for TopicGetTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "topic_get".to_string(),
            description: "Read a topic by exact name.".to_string(),
            input_schema: schema_for::<TopicGetArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: TopicGetArgs = serde_json::from_value(args.clone())?;
        match self.store.get_topic(&args.name)? {
            Some(topic) => Ok(ToolOutput::text(format!(
                "# {} (updated {})\n{}",
                topic.name,
                format_ts(topic.updated_at),
                topic.content
            ))),
            None => Ok(ToolOutput::text(format!("Topic '{}' not found.", args.name))),
        }
    }
}

// ── topic_list ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicListArgs {}

pub struct TopicListTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for TopicListTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "topic_list".to_string(),
            description: "List all topic names with their last update time.".to_string(),
            input_schema: schema_for::<TopicListArgs>(),
        }
    }

    async fn run(&self, _args: &Value) -> Result<ToolOutput> {
        let topics = self.store.list_topics()?;
        if topics.is_empty() {
            return Ok(ToolOutput::text("No topics yet."));
        }
        let lines: Vec<String> = topics
            .iter()
            .map(|t| format!("- {} (updated {})", t.name, format_ts(t.updated_at)))
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

// ── topic_search ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicSearchArgs {
    query: String,
    limit: Option<usize>,
}

pub struct TopicSearchTool {
    pub store: Arc<Store>,
    pub embedder: Arc<Embedder>,
}

#[async_trait]
impl Tool for TopicSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "topic_search".to_string(),
            description: "Semantic search over topics.".to_string(),
            input_schema: schema_for::<TopicSearchArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: TopicSearchArgs = serde_json::from_value(args.clone())?;
        let limit = args.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

        let hits = search_topics(&self.store, &self.embedder, &args.query, limit).await?;
        if hits.is_empty() {
            return Ok(ToolOutput::text("No matching topics."));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|hit| format!("[{:.2}] {}: {}", hit.score, hit.item.name, hit.item.content))
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

// ── state_read ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct StateReadArgs {
    name: String,
}

pub struct StateReadTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for StateReadTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "state_read".to_string(),
            description: "Read a state file by name.".to_string(),
            input_schema: schema_for::<StateReadArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: StateReadArgs = serde_json::from_value(args.clone())?;
        match self.store.read_state_file(&args.name)? {
            Some(file) => Ok(ToolOutput::text(file.content)),
            None => Ok(ToolOutput::text(format!(
                "State file '{}' does not exist.",
                args.name
            ))),
        }
    }
}

// ── state_write ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct StateWriteArgs {
    /// State file name. `identity`, `today`, and the user persona name are
    /// read by the prompt; any other name is accepted and round-tripped.
    name: String,
    content: String,
}

pub struct StateWriteTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for StateWriteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "state_write".to_string(),
            description: "Overwrite a state file.".to_string(),
            input_schema: schema_for::<StateWriteArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: StateWriteArgs = serde_json::from_value(args.clone())?;
        let store = self.store.clone();
        with_retry(move || store.write_state_file(&args.name, &args.content, now_ms())).await?;
        Ok(ToolOutput::text("State file written."))
    }
}

pub(crate) fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
