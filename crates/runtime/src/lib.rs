//! Orchestration runtime: trigger intake, the session coordinator, context
//! assembly, the ambient tick loop, and coding-task delegation.

pub mod ambient;
pub mod coding;
pub mod context;
pub mod coordinator;
pub mod github;

use minder_memory::{MessageSource, TriggerKind};

/// An input that causes one reasoning turn.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A user message from a chat transport.
    Message {
        text: String,
        source: MessageSource,
        chat_id: Option<i64>,
    },
    /// A reminder fired by the scheduler.
    Alarm { description: String, payload: String },
    /// A periodic tick with no external cause.
    Ambient,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Message { .. } => TriggerKind::Message,
            Trigger::Alarm { .. } => TriggerKind::Alarm,
            Trigger::Ambient => TriggerKind::Ambient,
        }
    }

    /// Coalesce a queued trigger with a newer one of the same kind/source.
    /// User text concatenates (never drops); for other kinds the newer
    /// trigger wins.  Returns `Err((old, new))` when the pair must not merge.
    pub fn coalesce(self, newer: Trigger) -> Result<Trigger, (Trigger, Trigger)> {
        match (self, newer) {
            (
                Trigger::Message { text: old, source: s1, chat_id: c1 },
                Trigger::Message { text: new, source: s2, chat_id: c2 },
            ) if s1 == s2 && c1 == c2 => Ok(Trigger::Message {
                text: format!("{old}\n{new}"),
                source: s1,
                chat_id: c1,
            }),
            (Trigger::Ambient, Trigger::Ambient) => Ok(Trigger::Ambient),
            (old, new) => Err((old, new)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_source_messages_concatenate() {
        let a = Trigger::Message {
            text: "search the web for X".to_string(),
            source: MessageSource::Telegram,
            chat_id: Some(1),
        };
        let b = Trigger::Message {
            text: "cancel, search for Y".to_string(),
            source: MessageSource::Telegram,
            chat_id: Some(1),
        };
        let merged = a.coalesce(b).unwrap();
        match merged {
            Trigger::Message { text, .. } => {
                assert_eq!(text, "search the web for X\ncancel, search for Y");
            }
            other => panic!("unexpected merge result: {other:?}"),
        }
    }

    #[test]
    fn different_kinds_do_not_merge() {
        let message = Trigger::Message {
            text: "hi".to_string(),
            source: MessageSource::Telegram,
            chat_id: None,
        };
        let alarm = Trigger::Alarm {
            description: "water".to_string(),
            payload: "drink".to_string(),
        };
        assert!(message.coalesce(alarm).is_err());
    }

    #[test]
    fn ambient_ticks_collapse() {
        assert!(matches!(
            Trigger::Ambient.coalesce(Trigger::Ambient),
            Ok(Trigger::Ambient)
        ));
    }
}
