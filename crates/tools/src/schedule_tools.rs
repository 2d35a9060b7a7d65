//! Scheduling tools.  Every mutation ends with a [`Scheduler::reschedule`]
//! so the single wall-clock alarm always reflects the reminder table.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use minder_memory::{Reminder, Schedule, Store, with_retry};
use minder_scheduler::{CronExpr, Scheduler};

use crate::memory_tools::format_ts;
use crate::{Tool, ToolOutput, ToolSpec, now_ms, schema_for};

// ── schedule_recurring ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ScheduleRecurringArgs {
    /// Human description shown when the reminder fires.
    description: String,
    /// 5-field cron expression (`minute hour day-of-month month day-of-week`,
    /// each field `*` or an integer, day-of-week 0=Sunday).
    cron_expression: String,
    /// Text handed back to you when the reminder fires.
    payload: Option<String>,
    /// Stable id; generated when omitted.
    id: Option<String>,
}

pub struct ScheduleRecurringTool {
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
}

#[async_trait]
impl Tool for ScheduleRecurringTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "schedule_recurring".to_string(),
            description: "Schedule a recurring reminder from a cron expression. Fires until cancelled.".to_string(),
            input_schema: schema_for::<ScheduleRecurringArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: ScheduleRecurringArgs = serde_json::from_value(args.clone())?;

        // Reject bad expressions up front; a stored-but-unparseable reminder
        // would never fire.
        if let Err(err) = CronExpr::parse(&args.cron_expression) {
            return Ok(ToolOutput::error(err.to_string()));
        }

        let reminder = Reminder {
            id: args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            description: args.description,
            payload: args.payload.unwrap_or_default(),
            created_at: now_ms(),
            schedule: Schedule::Cron(args.cron_expression),
        };
        let store = self.store.clone();
        let saved = reminder.clone();
        with_retry(move || store.save_reminder(&saved)).await?;
        self.scheduler.reschedule().await?;

        Ok(ToolOutput::text(format!(
            "Recurring reminder '{}' scheduled (id {}).",
            reminder.description, reminder.id
        )))
    }
}

// ── schedule_once ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ScheduleOnceArgs {
    description: String,
    /// ISO-8601 datetime, e.g. `2026-03-10T09:00:00Z`. A value without an
    /// offset is read as UTC.
    datetime: String,
    payload: Option<String>,
    id: Option<String>,
}

pub struct ScheduleOnceTool {
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
}

#[async_trait]
impl Tool for ScheduleOnceTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "schedule_once".to_string(),
            description: "Schedule a one-shot reminder for an ISO datetime. Fires once, then is deleted.".to_string(),
            input_schema: schema_for::<ScheduleOnceArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: ScheduleOnceArgs = serde_json::from_value(args.clone())?;

        let Some(at) = parse_iso_datetime(&args.datetime) else {
            return Ok(ToolOutput::error(format!(
                "could not parse datetime {:?} — use ISO-8601, e.g. 2026-03-10T09:00:00Z",
                args.datetime
            )));
        };

        let reminder = Reminder {
            id: args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            description: args.description,
            payload: args.payload.unwrap_or_default(),
            created_at: now_ms(),
            schedule: Schedule::At(at),
        };
        let store = self.store.clone();
        let saved = reminder.clone();
        with_retry(move || store.save_reminder(&saved)).await?;
        self.scheduler.reschedule().await?;

        Ok(ToolOutput::text(format!(
            "Reminder '{}' scheduled for {} (id {}).",
            reminder.description,
            format_ts(at),
            reminder.id
        )))
    }
}

// ── cancel_reminder ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct CancelReminderArgs {
    id: String,
}

pub struct CancelReminderTool {
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
}

#[async_trait]
impl Tool for CancelReminderTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "cancel_reminder".to_string(),
            description: "Cancel a reminder by id. Cancelling an unknown id is harmless.".to_string(),
            input_schema: schema_for::<CancelReminderArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: CancelReminderArgs = serde_json::from_value(args.clone())?;
        let store = self.store.clone();
        let id = args.id.clone();
        let existed = with_retry(move || store.delete_reminder(&id)).await?;
        self.scheduler.reschedule().await?;

        if existed {
            Ok(ToolOutput::text(format!("Reminder {} cancelled.", args.id)))
        } else {
            Ok(ToolOutput::text(format!(
                "No reminder with id {} — nothing to cancel.",
                args.id
            )))
        }
    }
}

// ── list_reminders ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ListRemindersArgs {}

pub struct ListRemindersTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for ListRemindersTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_reminders".to_string(),
            description: "List all pending reminders.".to_string(),
            input_schema: schema_for::<ListRemindersArgs>(),
        }
    }

    async fn run(&self, _args: &Value) -> Result<ToolOutput> {
        let reminders = self.store.list_reminders()?;
        if reminders.is_empty() {
            return Ok(ToolOutput::text("No pending reminders."));
        }
        let lines: Vec<String> = reminders
            .iter()
            .map(|r| match &r.schedule {
                Schedule::Cron(expr) => {
                    format!("- [{}] {} (cron: {})", r.id, r.description, expr)
                }
                Schedule::At(at) => {
                    format!("- [{}] {} (at {})", r.id, r.description, format_ts(*at))
                }
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

/// RFC 3339 first, then a bare `YYYY-MM-DDTHH:MM[:SS]` read as UTC.
fn parse_iso_datetime(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_offset() {
        let ms = parse_iso_datetime("2026-03-10T09:00:00+02:00").unwrap();
        let utc = DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-03-10T07:00:00+00:00");
    }

    #[test]
    fn parses_naive_as_utc() {
        let ms = parse_iso_datetime("2026-03-10T09:00:00").unwrap();
        let utc = DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-03-10T09:00:00+00:00");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_iso_datetime("next tuesday").is_none());
        assert!(parse_iso_datetime("").is_none());
    }
}
