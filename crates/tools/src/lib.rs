use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Static metadata about a tool, advertised to the reasoning engine during
/// MCP discovery.  `input_schema` is the JSON-Schema object describing the
/// tool's arguments; tools derive it from their argument struct so the
/// advertised schema and the parsed struct cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One part of a tool result.  Only text parts exist today; the enum keeps
/// the wire shape (`{"type": "text", "text": ...}`) extensible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
}

/// The envelope every tool call returns, mirrored onto the MCP wire as
/// `{content: [...], isError: bool}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ContentPart>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Concatenated text of all parts — handy in tests and logs.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Trait implemented by every tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &Value) -> Result<ToolOutput>;
}

/// Build the JSON-Schema value for an argument struct.
pub fn schema_for<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object" })
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Maps to JSON-RPC −32601 at the MCP layer.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    /// Validate `args` against the tool's advertised schema and dispatch.
    ///
    /// Only an unknown tool name is a dispatch-level error; every handler
    /// failure (missing arguments, handler `Err`, anything) is converted into
    /// an `isError: true` envelope so a misbehaving tool can never take the
    /// dispatcher down with it.
    pub async fn call_tool(&self, name: &str, args: &Value) -> Result<ToolOutput, DispatchError> {
        let tool = self
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        if let Some(missing) = missing_required(&tool.spec().input_schema, args) {
            return Ok(ToolOutput::error(format!(
                "invalid arguments for {name}: missing required field(s) {}",
                missing.join(", ")
            )));
        }

        match tool.run(args).await {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::warn!(tool = name, %err, "tool handler failed");
                Ok(ToolOutput::error(format!("{name} failed: {err}")))
            }
        }
    }
}

/// Fields listed in the schema's `required` array but absent from `args`.
fn missing_required(schema: &Value, args: &Value) -> Option<Vec<String>> {
    let required = schema.get("required")?.as_array()?;
    let provided: &serde_json::Map<String, Value> = match args.as_object() {
        Some(map) => map,
        None if required.is_empty() => return None,
        None => {
            return Some(
                required
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
            );
        }
    };

    let missing: Vec<String> = required
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|field| !provided.contains_key(*field))
        .map(String::from)
        .collect();
    if missing.is_empty() { None } else { Some(missing) }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod chat;
pub mod memory_tools;
pub mod schedule_tools;
pub mod summary_tools;
pub mod web;

pub use chat::{ChatSink, SendTelegramTool};
pub use memory_tools::{
    JournalSearchTool, JournalWriteTool, StateReadTool, StateWriteTool, TopicGetTool,
    TopicListTool, TopicSearchTool, TopicWriteTool,
};
pub use schedule_tools::{
    CancelReminderTool, ListRemindersTool, ScheduleOnceTool, ScheduleRecurringTool,
};
pub use summary_tools::{GetRecentSummariesTool, SaveConversationSummaryTool};
pub use web::{FetchPageTool, NewsSearchTool, UrlAllowList, WebSearchTool};

// ── ToolRegistry tests ───────────────────────────────────────────────────────
