use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.  Every persisted timestamp in the
/// store uses this representation.
pub type Millis = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// What caused a reasoning turn to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Message,
    Alarm,
    Ambient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Telegram,
    Web,
    Api,
}

/// One entry in the conversation buffer.  Append-only; rows disappear only
/// when a [`Summary`] absorbs a prefix or the buffer is explicitly reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: Millis,
    pub trigger: TriggerKind,
    pub source: Option<MessageSource>,
}

/// Append-only observation log entry.  Never mutated after write.  An entry
/// without an embedding is invisible to semantic search but still listed by
/// recency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub timestamp: Millis,
    pub topic: String,
    pub content: String,
}

/// Named, overwritable short text injected into prompts.  Reserved names the
/// core reads: `identity`, `today`, and one name per user persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub name: String,
    pub content: String,
    pub updated_at: Millis,
}

/// A mutable, named distillation of knowledge, searchable by embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: Uuid,
    pub name: String,
    pub content: String,
    pub created_at: Millis,
    pub updated_at: Millis,
}

/// When a reminder fires.  Exactly one variant per reminder — representing
/// the schedule as an enum makes the "exactly one of cron/one-shot" rule
/// unrepresentable to violate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// 5-field cron expression; the reminder recurs until cancelled.
    Cron(String),
    /// One-shot wall-clock time; the reminder is deleted when it fires.
    At(Millis),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub description: String,
    pub payload: String,
    pub created_at: Millis,
    pub schedule: Schedule,
}

impl Reminder {
    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::At(_))
    }
}

/// Compressed record replacing a prefix of the message buffer.  Writing one
/// deletes the absorbed messages in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: Uuid,
    pub timestamp: Millis,
    pub content: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub open_threads: Vec<String>,
    #[serde(default)]
    pub learned_patterns: Vec<String>,
    pub from_timestamp: Millis,
    pub to_timestamp: Millis,
    pub message_count: usize,
}

/// Continuation handle for a per-repo long-running coding session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingTaskState {
    pub repo_url: String,
    pub branch: String,
    pub session_id: Option<String>,
    pub last_task: String,
    pub last_timestamp: Millis,
}

/// Snapshot of the conversation buffer used by the context builder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConversationStats {
    pub count: usize,
    pub approx_tokens: usize,
    pub needs_compaction: bool,
}
