//! Durable store for every entity the orchestrator persists, backed by
//! [`redb`].
//!
//! All values are serde-JSON records; embeddings live in sibling tables as
//! opaque little-endian `f32` blobs prefixed with a 4-byte dimension tag.
//! The first embedding written pins the store's dimension in the `meta`
//! table and later mismatches are refused.
//!
//! Keys for time-ordered tables are `"{timestamp:020}-{id}"` so redb's
//! lexicographic key order is chronological order.

use std::path::Path;
use std::time::Duration;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;
use uuid::Uuid;

use crate::schema::{
    CodingTaskState, ConversationStats, JournalEntry, Message, Millis, Reminder, StateFile,
    Summary, Topic,
};

const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const JOURNAL: TableDefinition<&str, &[u8]> = TableDefinition::new("journal");
const JOURNAL_EMBED: TableDefinition<&str, &[u8]> = TableDefinition::new("journal_embeddings");
const STATE_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("state_files");
const TOPICS: TableDefinition<&str, &[u8]> = TableDefinition::new("topics");
const TOPIC_EMBED: TableDefinition<&str, &[u8]> = TableDefinition::new("topic_embeddings");
const REMINDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("reminders");
const SUMMARIES: TableDefinition<&str, &[u8]> = TableDefinition::new("summaries");
const CODING_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("coding_task_state");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_EMBED_DIM: &str = "embedding_dim";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient failure — the caller may retry with backoff.
    #[error("storage retryable: {0}")]
    Retryable(String),
    /// Schema mismatch, corruption, or a logic error.  Aborts the current
    /// invocation, never the process.
    #[error("storage fatal: {0}")]
    Fatal(String),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Fatal(e.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Retryable(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Fatal(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Retryable(e.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Retryable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Fatal(e.to_string())
    }
}

/// Retry policy for [`StoreError::Retryable`]: up to 3 retries at
/// 100 ms / 500 ms / 2 s before the error surfaces.
pub async fn with_retry<T, F>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    const BACKOFF: [Duration; 3] = [
        Duration::from_millis(100),
        Duration::from_millis(500),
        Duration::from_secs(2),
    ];

    let mut attempt = 0;
    loop {
        match op() {
            Err(StoreError::Retryable(msg)) if attempt < BACKOFF.len() => {
                warn!(attempt, %msg, "retryable store error — backing off");
                tokio::time::sleep(BACKOFF[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ── key & embedding encodings ────────────────────────────────────────────────

fn ts_key(timestamp: Millis, id: &Uuid) -> String {
    format!("{:020}-{}", timestamp.max(0), id)
}

fn ts_of_key(key: &str) -> Millis {
    key.get(..20).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + vector.len() * 4);
    out.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_embedding(raw: &[u8], expect_dim: u32) -> Option<Vec<f32>> {
    if raw.len() < 4 {
        return None;
    }
    let dim = u32::from_le_bytes(raw[..4].try_into().ok()?);
    if dim != expect_dim || raw.len() != 4 + dim as usize * 4 {
        // Dimension mismatch means a different embedding model wrote this
        // vector; it must not be compared against current-model queries.
        warn!(stored = dim, expected = expect_dim, "refusing embedding with mismatched dimension");
        return None;
    }
    let mut out = Vec::with_capacity(dim as usize);
    for chunk in raw[4..].chunks_exact(4) {
        out.push(f32::from_le_bytes(chunk.try_into().ok()?));
    }
    Some(out)
}

// ── Store ────────────────────────────────────────────────────────────────────

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the store at `path`, creating all tables up front so
    /// read paths never race table creation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Fatal(format!("creating {}: {e}", parent.display())))?;
        }
        let db = Database::create(path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(MESSAGES)?;
            tx.open_table(JOURNAL)?;
            tx.open_table(JOURNAL_EMBED)?;
            tx.open_table(STATE_FILES)?;
            tx.open_table(TOPICS)?;
            tx.open_table(TOPIC_EMBED)?;
            tx.open_table(REMINDERS)?;
            tx.open_table(SUMMARIES)?;
            tx.open_table(CODING_TASKS)?;
            tx.open_table(META)?;
            tx.commit()?;
        }
        Ok(Self { db })
    }

    // ── messages ─────────────────────────────────────────────────────────────

    /// Append to the conversation buffer.  Timestamps are forced strictly
    /// increasing (a same-millisecond append is bumped past the newest row)
    /// so the user/assistant pair of one turn can never reorder.
    pub fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(MESSAGES)?;
            let last_ts = {
                let mut rows = tbl.iter()?;
                match rows.next_back().transpose()? {
                    Some((key, _)) => ts_of_key(key.value()),
                    None => -1,
                }
            };
            let mut stored = message.clone();
            if stored.timestamp <= last_ts {
                stored.timestamp = last_ts + 1;
            }
            let key = ts_key(stored.timestamp, &stored.id);
            let bytes = serde_json::to_vec(&stored)?;
            tbl.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The newest `limit` messages, returned ascending by timestamp.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(MESSAGES)?;
        let mut out: Vec<Message> = Vec::new();
        for row in tbl.iter()?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        out.reverse();
        Ok(out)
    }

    pub fn conversation_stats(&self, compact_threshold: usize) -> Result<ConversationStats, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(MESSAGES)?;
        let mut count = 0usize;
        let mut chars = 0usize;
        for row in tbl.iter()? {
            let (_, value) = row?;
            let message: Message = serde_json::from_slice(value.value())?;
            count += 1;
            chars += message.content.chars().count();
        }
        let approx_tokens = chars.div_ceil(4);
        Ok(ConversationStats {
            count,
            approx_tokens,
            needs_compaction: approx_tokens > compact_threshold,
        })
    }

    /// Delete every message in the buffer.  Returns how many were removed.
    pub fn clear_conversation(&self) -> Result<usize, StoreError> {
        let tx = self.db.begin_write()?;
        let removed;
        {
            let mut tbl = tx.open_table(MESSAGES)?;
            let keys: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            removed = keys.len();
            for key in &keys {
                tbl.remove(key.as_str())?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    // ── summaries ────────────────────────────────────────────────────────────

    /// Write `summary` and delete every message with
    /// `timestamp ≤ summary.to_timestamp` in the same transaction, so a crash
    /// can never leave absorbed messages dangling.
    pub fn save_summary(&self, summary: &Summary) -> Result<usize, StoreError> {
        let key = ts_key(summary.timestamp, &summary.id);
        let bytes = serde_json::to_vec(summary)?;
        let tx = self.db.begin_write()?;
        let pruned;
        {
            let mut summaries = tx.open_table(SUMMARIES)?;
            summaries.insert(key.as_str(), bytes.as_slice())?;

            let mut messages = tx.open_table(MESSAGES)?;
            let absorbed: Vec<String> = messages
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .filter(|k| ts_of_key(k) <= summary.to_timestamp)
                .collect();
            pruned = absorbed.len();
            for k in &absorbed {
                messages.remove(k.as_str())?;
            }
        }
        tx.commit()?;
        Ok(pruned)
    }

    /// The newest `count` summaries, newest first.
    pub fn recent_summaries(&self, count: usize) -> Result<Vec<Summary>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SUMMARIES)?;
        let mut out = Vec::new();
        for row in tbl.iter()?.rev() {
            if out.len() >= count {
                break;
            }
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    pub fn last_summary(&self) -> Result<Option<Summary>, StoreError> {
        Ok(self.recent_summaries(1)?.into_iter().next())
    }

    // ── journal ──────────────────────────────────────────────────────────────

    /// Append a journal entry, optionally with its embedding.  The first
    /// embedding ever written pins the store's dimension; a different
    /// dimension later is refused as fatal.
    pub fn write_journal(
        &self,
        entry: &JournalEntry,
        embedding: Option<&[f32]>,
    ) -> Result<(), StoreError> {
        let key = ts_key(entry.timestamp, &entry.id);
        let bytes = serde_json::to_vec(entry)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(JOURNAL)?;
            tbl.insert(key.as_str(), bytes.as_slice())?;

            if let Some(vector) = embedding {
                Self::check_dim(&tx, vector.len() as u32)?;
                let blob = encode_embedding(vector);
                let mut emb = tx.open_table(JOURNAL_EMBED)?;
                emb.insert(key.as_str(), blob.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The newest `limit` entries, ascending by timestamp.
    pub fn recent_journal(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(JOURNAL)?;
        let mut out: Vec<JournalEntry> = Vec::new();
        for row in tbl.iter()?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        out.reverse();
        Ok(out)
    }

    /// Newest-first journal entries that carry a valid embedding, scanning at
    /// most `max_scanned` rows.  Entries without an embedding (or with a
    /// mismatched dimension) are skipped, not errors.
    pub fn list_journal_with_embeddings(
        &self,
        max_scanned: usize,
    ) -> Result<Vec<(JournalEntry, Vec<f32>)>, StoreError> {
        let tx = self.db.begin_read()?;
        let dim = match Self::read_dim_tx(&tx)? {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        let tbl = tx.open_table(JOURNAL)?;
        let emb = tx.open_table(JOURNAL_EMBED)?;
        let mut out = Vec::new();
        let mut scanned = 0usize;
        for row in tbl.iter()?.rev() {
            if scanned >= max_scanned {
                break;
            }
            scanned += 1;
            let (key, value) = row?;
            let Some(blob) = emb.get(key.value())? else {
                continue;
            };
            let Some(vector) = decode_embedding(blob.value(), dim) else {
                continue;
            };
            let entry: JournalEntry = serde_json::from_slice(value.value())?;
            out.push((entry, vector));
        }
        Ok(out)
    }

    // ── topics ───────────────────────────────────────────────────────────────

    /// Insert or overwrite the topic named `name`.  Overwriting preserves
    /// `created_at` and the id, bumps `updated_at`, and replaces the stored
    /// embedding (removing it when `embedding` is `None`).
    pub fn upsert_topic(
        &self,
        name: &str,
        content: &str,
        embedding: Option<&[f32]>,
        now: Millis,
    ) -> Result<Topic, StoreError> {
        let tx = self.db.begin_write()?;
        let topic;
        {
            let mut tbl = tx.open_table(TOPICS)?;
            let existing: Option<Topic> = match tbl.get(name)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            topic = match existing {
                Some(prev) => Topic {
                    content: content.to_string(),
                    updated_at: now,
                    ..prev
                },
                None => Topic {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    content: content.to_string(),
                    created_at: now,
                    updated_at: now,
                },
            };
            let bytes = serde_json::to_vec(&topic)?;
            tbl.insert(name, bytes.as_slice())?;

            let mut emb = tx.open_table(TOPIC_EMBED)?;
            match embedding {
                Some(vector) => {
                    Self::check_dim(&tx, vector.len() as u32)?;
                    let blob = encode_embedding(vector);
                    emb.insert(name, blob.as_slice())?;
                }
                None => {
                    emb.remove(name)?;
                }
            }
        }
        tx.commit()?;
        Ok(topic)
    }

    pub fn get_topic(&self, name: &str) -> Result<Option<Topic>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TOPICS)?;
        match tbl.get(name)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All topics, in name order.
    pub fn list_topics(&self) -> Result<Vec<Topic>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TOPICS)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Topics that carry a valid embedding, most recently updated first,
    /// capped at `max_scanned`.
    pub fn list_topics_with_embeddings(
        &self,
        max_scanned: usize,
    ) -> Result<Vec<(Topic, Vec<f32>)>, StoreError> {
        let tx = self.db.begin_read()?;
        let dim = match Self::read_dim_tx(&tx)? {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        let tbl = tx.open_table(TOPICS)?;
        let emb = tx.open_table(TOPIC_EMBED)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (key, value) = row?;
            let Some(blob) = emb.get(key.value())? else {
                continue;
            };
            let Some(vector) = decode_embedding(blob.value(), dim) else {
                continue;
            };
            let topic: Topic = serde_json::from_slice(value.value())?;
            out.push((topic, vector));
        }
        out.sort_by_key(|(t, _)| std::cmp::Reverse(t.updated_at));
        out.truncate(max_scanned);
        Ok(out)
    }

    // ── state files ──────────────────────────────────────────────────────────

    pub fn write_state_file(&self, name: &str, content: &str, now: Millis) -> Result<(), StoreError> {
        let record = StateFile {
            name: name.to_string(),
            content: content.to_string(),
            updated_at: now,
        };
        let bytes = serde_json::to_vec(&record)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(STATE_FILES)?;
            tbl.insert(name, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_state_file(&self, name: &str) -> Result<Option<StateFile>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(STATE_FILES)?;
        match tbl.get(name)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_state_files(&self) -> Result<Vec<StateFile>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(STATE_FILES)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // ── reminders ────────────────────────────────────────────────────────────

    pub fn save_reminder(&self, reminder: &Reminder) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(reminder)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(REMINDERS)?;
            tbl.insert(reminder.id.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns `true` when the reminder existed.  Deleting an unknown id is
    /// a no-op, which makes cancellation idempotent.
    pub fn delete_reminder(&self, id: &str) -> Result<bool, StoreError> {
        let tx = self.db.begin_write()?;
        let existed;
        {
            let mut tbl = tx.open_table(REMINDERS)?;
            existed = tbl.remove(id)?.is_some();
        }
        tx.commit()?;
        Ok(existed)
    }

    pub fn list_reminders(&self) -> Result<Vec<Reminder>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(REMINDERS)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // ── coding-task state ────────────────────────────────────────────────────

    pub fn get_coding_task_state(
        &self,
        repo_url: &str,
    ) -> Result<Option<CodingTaskState>, StoreError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(CODING_TASKS)?;
        match tbl.get(repo_url)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn save_coding_task_state(&self, state: &CodingTaskState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(CODING_TASKS)?;
            tbl.insert(state.repo_url.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── embedding dimension bookkeeping ──────────────────────────────────────

    fn check_dim(tx: &redb::WriteTransaction, dim: u32) -> Result<(), StoreError> {
        let mut meta = tx.open_table(META)?;
        let stored: Option<u32> = {
            let guard = meta.get(META_EMBED_DIM)?;
            match guard {
                Some(v) => Some(u32::from_le_bytes(
                    v.value()
                        .try_into()
                        .map_err(|_| StoreError::Fatal("corrupt embedding_dim meta".into()))?,
                )),
                None => None,
            }
        };
        match stored {
            Some(stored) if stored != dim => Err(StoreError::Fatal(format!(
                "embedding dimension {dim} does not match store dimension {stored}"
            ))),
            Some(_) => Ok(()),
            None => {
                meta.insert(META_EMBED_DIM, dim.to_le_bytes().as_slice())?;
                Ok(())
            }
        }
    }

    fn read_dim_tx(tx: &redb::ReadTransaction) -> Result<Option<u32>, StoreError> {
        let meta = tx.open_table(META)?;
        match meta.get(META_EMBED_DIM)? {
            Some(v) => {
                let stored = u32::from_le_bytes(
                    v.value()
                        .try_into()
                        .map_err(|_| StoreError::Fatal("corrupt embedding_dim meta".into()))?,
                );
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    pub fn embedding_dim(&self) -> Result<Option<u32>, StoreError> {
        let tx = self.db.begin_read()?;
        Self::read_dim_tx(&tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Role, Schedule, TriggerKind};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.redb")).unwrap();
        (dir, store)
    }

    fn message(ts: Millis, role: Role, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            role,
            content: content.to_string(),
            timestamp: ts,
            trigger: TriggerKind::Message,
            source: None,
        }
    }

    #[test]
    fn recent_messages_are_ascending_and_capped() {
        let (_dir, store) = open_store();
        for ts in [10, 20, 30, 40] {
            store.append_message(&message(ts, Role::User, "x")).unwrap();
        }

        let recent = store.recent_messages(3).unwrap();
        let stamps: Vec<Millis> = recent.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![20, 30, 40]);
    }

    #[test]
    fn same_millisecond_appends_stay_strictly_ordered() {
        let (_dir, store) = open_store();
        store.append_message(&message(100, Role::User, "question")).unwrap();
        store
            .append_message(&message(100, Role::Assistant, "answer"))
            .unwrap();

        let recent = store.recent_messages(10).unwrap();
        assert_eq!(recent[0].role, Role::User);
        assert_eq!(recent[1].role, Role::Assistant);
        assert!(recent[1].timestamp > recent[0].timestamp);
    }

    #[test]
    fn save_summary_prunes_absorbed_messages_atomically() {
        let (_dir, store) = open_store();
        for ts in [100, 200, 300, 400] {
            store.append_message(&message(ts, Role::User, "hello")).unwrap();
        }

        let summary = Summary {
            id: Uuid::new_v4(),
            timestamp: 500,
            content: "first era".to_string(),
            notes: None,
            key_decisions: vec![],
            open_threads: vec![],
            learned_patterns: vec![],
            from_timestamp: 100,
            to_timestamp: 300,
            message_count: 3,
        };
        let pruned = store.save_summary(&summary).unwrap();
        assert_eq!(pruned, 3);

        let remaining = store.recent_messages(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 400);
        assert_eq!(store.last_summary().unwrap().unwrap().content, "first era");
    }

    #[test]
    fn two_summaries_on_empty_buffer_both_persist() {
        let (_dir, store) = open_store();
        for (i, ts) in [(0, 1000), (1, 2000)] {
            let summary = Summary {
                id: Uuid::new_v4(),
                timestamp: ts,
                content: format!("summary {i}"),
                notes: None,
                key_decisions: vec![],
                open_threads: vec![],
                learned_patterns: vec![],
                from_timestamp: 0,
                to_timestamp: ts - 1,
                message_count: 0,
            };
            assert_eq!(store.save_summary(&summary).unwrap(), 0);
        }
        assert_eq!(store.recent_summaries(10).unwrap().len(), 2);
        assert!(store.recent_messages(10).unwrap().is_empty());
    }

    #[test]
    fn conversation_stats_counts_tokens_and_flags_compaction() {
        let (_dir, store) = open_store();
        store
            .append_message(&message(1, Role::User, &"a".repeat(41)))
            .unwrap();

        let stats = store.conversation_stats(10).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.approx_tokens, 11); // ceil(41 / 4)
        assert!(stats.needs_compaction);

        let relaxed = store.conversation_stats(50_000).unwrap();
        assert!(!relaxed.needs_compaction);
    }

    #[test]
    fn upsert_topic_preserves_created_at_and_bumps_updated_at() {
        let (_dir, store) = open_store();
        let first = store.upsert_topic("rust", "v1", None, 1000).unwrap();
        let second = store.upsert_topic("rust", "v2", None, 2000).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, 1000);
        assert_eq!(second.updated_at, 2000);
        assert_eq!(store.get_topic("rust").unwrap().unwrap().content, "v2");
    }

    #[test]
    fn journal_without_embedding_is_listed_but_not_searchable() {
        let (_dir, store) = open_store();
        let entry = JournalEntry {
            id: Uuid::new_v4(),
            timestamp: 10,
            topic: "notes".to_string(),
            content: "no vector".to_string(),
        };
        store.write_journal(&entry, None).unwrap();

        assert_eq!(store.recent_journal(5).unwrap().len(), 1);
        assert!(store.list_journal_with_embeddings(100).unwrap().is_empty());
    }

    #[test]
    fn embedding_dimension_is_pinned_on_first_write() {
        let (_dir, store) = open_store();
        let entry = JournalEntry {
            id: Uuid::new_v4(),
            timestamp: 10,
            topic: "t".to_string(),
            content: "c".to_string(),
        };
        store.write_journal(&entry, Some(&[0.6, 0.8])).unwrap();
        assert_eq!(store.embedding_dim().unwrap(), Some(2));

        let other = JournalEntry {
            id: Uuid::new_v4(),
            timestamp: 20,
            topic: "t".to_string(),
            content: "c".to_string(),
        };
        let err = store.write_journal(&other, Some(&[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }

    #[test]
    fn reminders_round_trip_and_delete_is_idempotent() {
        let (_dir, store) = open_store();
        let reminder = Reminder {
            id: "r1".to_string(),
            description: "water".to_string(),
            payload: "drink water".to_string(),
            created_at: 1,
            schedule: Schedule::At(60_000),
        };
        store.save_reminder(&reminder).unwrap();
        assert_eq!(store.list_reminders().unwrap().len(), 1);

        assert!(store.delete_reminder("r1").unwrap());
        assert!(!store.delete_reminder("r1").unwrap());
        assert!(store.list_reminders().unwrap().is_empty());
    }

    #[test]
    fn state_files_round_trip_unknown_names() {
        let (_dir, store) = open_store();
        store.write_state_file("custom-notes", "anything", 5).unwrap();
        let read = store.read_state_file("custom-notes").unwrap().unwrap();
        assert_eq!(read.content, "anything");
        assert_eq!(read.updated_at, 5);
        assert!(store.read_state_file("identity").unwrap().is_none());
    }

    #[test]
    fn coding_task_state_overwrites_by_repo() {
        let (_dir, store) = open_store();
        let state = CodingTaskState {
            repo_url: "https://github.com/o/r".to_string(),
            branch: "outie/add-logging-a1b2c3".to_string(),
            session_id: Some("s1".to_string()),
            last_task: "Add logging".to_string(),
            last_timestamp: 100,
        };
        store.save_coding_task_state(&state).unwrap();
        store
            .save_coding_task_state(&CodingTaskState {
                last_timestamp: 200,
                ..state.clone()
            })
            .unwrap();

        let loaded = store.get_coding_task_state("https://github.com/o/r").unwrap().unwrap();
        assert_eq!(loaded.last_timestamp, 200);
    }

    #[test]
    fn clear_conversation_leaves_other_tables_alone() {
        let (_dir, store) = open_store();
        store.append_message(&message(1, Role::User, "hi")).unwrap();
        store.write_state_file("identity", "I am Minder", 1).unwrap();

        assert_eq!(store.clear_conversation().unwrap(), 1);
        assert!(store.recent_messages(10).unwrap().is_empty());
        assert!(store.read_state_file("identity").unwrap().is_some());
    }

    #[tokio::test]
    async fn with_retry_retries_then_surfaces() {
        let mut attempts = 0;
        let result: Result<(), StoreError> = with_retry(|| {
            attempts += 1;
            Err(StoreError::Retryable("busy".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 4); // initial try + 3 retries
    }
}
