//! Deterministic prompt assembly.
//!
//! Two strings go to the engine: a stable system prompt (identity + fixed
//! operating principles — byte-identical between turns while identity is
//! unchanged, so the engine's prompt cache stays warm) and the dynamic
//! context envelope (time, buffer status, state files, journal, last
//! summary, recent conversation) with a trigger-specific tail.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use minder_memory::{ConversationStats, Store, StoreError};

use crate::Trigger;

pub const RECENT_JOURNAL_COUNT: usize = 40;
pub const RECENT_MESSAGE_COUNT: usize = 30;
pub const MESSAGE_TRUNCATE_CHARS: usize = 5_000;

/// Identity used until the agent writes its own `identity` state file.
pub const DEFAULT_IDENTITY: &str = "You are Minder, a persistent personal assistant. You keep \
durable notes in your journal and topics, schedule your own reminders, and speak to your user \
over Telegram.";

const OPERATING_PRINCIPLES: &str = "\
Operating principles:
- Your memory between conversations is only what you store: use journal_write for observations, \
topic_write for distilled knowledge, and state_write for the short files injected into every prompt.
- Look things up before claiming you do not know them (journal_search, topic_search).
- Schedule follow-ups with schedule_once or schedule_recurring instead of promising to remember.
- Be concise in chat; put detail into memory rather than the conversation.";

/// The stable system prompt: identity state file (or the default) plus the
/// fixed operating-principles block.
pub fn system_prompt(store: &Store) -> Result<String, StoreError> {
    let identity = store
        .read_state_file("identity")?
        .map(|f| f.content)
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    Ok(format!("{identity}\n\n{OPERATING_PRINCIPLES}"))
}

pub struct EnvelopeInputs<'a> {
    pub store: &'a Store,
    pub compact_threshold: usize,
    pub timezone: Tz,
    /// State-file name of the user persona (e.g. `user`).
    pub user_persona: &'a str,
    pub now: DateTime<Utc>,
}

/// Assemble the dynamic context envelope.  Section order is part of the
/// contract; the last conversation section ends the envelope so the trigger
/// tail reads as its continuation.
pub fn dynamic_envelope(inputs: &EnvelopeInputs<'_>) -> Result<(String, ConversationStats), StoreError> {
    let store = inputs.store;
    let stats = store.conversation_stats(inputs.compact_threshold)?;

    let local = inputs.now.with_timezone(&inputs.timezone);
    let mut out = String::new();

    out.push_str(&format!(
        "<current_time>\n{}\n{}\n</current_time>\n\n",
        inputs.now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        local.format("%A, %B %e %Y, %H:%M (%Z)"),
    ));

    out.push_str(&format!(
        "<context_status>\nmessages: {}\napprox_tokens: {}\ncompact_threshold: {}\nneeds_compaction: {}\n</context_status>\n\n",
        stats.count, stats.approx_tokens, inputs.compact_threshold, stats.needs_compaction,
    ));

    out.push_str("<state_files>\n");
    for name in ["identity", "today", inputs.user_persona] {
        let content = store
            .read_state_file(name)?
            .map(|f| f.content)
            .unwrap_or_else(|| "(empty)".to_string());
        out.push_str(&format!("<{name}>\n{content}\n</{name}>\n"));
    }
    out.push_str("</state_files>\n\n");

    let journal = store.recent_journal(RECENT_JOURNAL_COUNT)?;
    out.push_str(&format!("<recent_journal count=\"{RECENT_JOURNAL_COUNT}\">\n"));
    for entry in &journal {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            format_ts(entry.timestamp),
            entry.topic,
            entry.content
        ));
    }
    if journal.is_empty() {
        out.push_str("(none)\n");
    }
    out.push_str("</recent_journal>\n\n");

    out.push_str("<last_summary>\n");
    match store.last_summary()? {
        Some(summary) => out.push_str(&format!(
            "[{} — {} messages absorbed]\n{}\n",
            format_ts(summary.timestamp),
            summary.message_count,
            summary.content
        )),
        None => out.push_str("(none)\n"),
    }
    out.push_str("</last_summary>\n\n");

    let messages = store.recent_messages(RECENT_MESSAGE_COUNT)?;
    out.push_str("<recent_conversation>\n");
    for message in &messages {
        let role = match message.role {
            minder_memory::Role::User => "user",
            minder_memory::Role::Assistant => "assistant",
        };
        out.push_str(&format!(
            "[{}] {role}: {}\n",
            format_ts(message.timestamp),
            truncate(&message.content, MESSAGE_TRUNCATE_CHARS)
        ));
    }
    if messages.is_empty() {
        out.push_str("(none)\n");
    }
    out.push_str("</recent_conversation>");

    Ok((out, stats))
}

/// The trigger-specific tail appended after the envelope.
pub fn trigger_tail(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Message { text, .. } => format!("User message: {text}"),
        Trigger::Alarm { description, payload } => format!(
            "A scheduled reminder fired.\nDescription: {description}\nPayload: {payload}\n\
             Your reply to this prompt is NOT delivered to the chat. If the user should see \
             anything, call send_telegram.",
        ),
        Trigger::Ambient => "Ambient tick — no external input. Your reply is NOT delivered to \
             the chat; use send_telegram only if something genuinely needs the user's attention. \
             Otherwise you may answer briefly for the log."
            .to_string(),
    }
}

/// Appended when the buffer is over threshold.
pub fn compaction_notice() -> &'static str {
    "\n\nThe conversation buffer is over its compaction threshold. Call \
     save_conversation_summary now to archive the older part of this conversation."
}

fn format_ts(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Cap `text` at `max_chars` characters with an ellipsis marker.  Slices at
/// the byte offset of the first excess character, so no intermediate
/// allocation and no mid-character cuts.
fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}
