//! Minimal 5-field cron evaluator.
//!
//! Grammar per field: `*` or a single integer literal.  Fields are
//! `minute hour day-of-month month day-of-week`, day-of-week numbered with
//! 0 = Sunday.  Anything richer (ranges, steps, names, macros) is rejected
//! up front — the error message names the supported grammar so callers are
//! never left guessing why `*/5` bounced.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression: {0} (supported grammar: 5 fields, each `*` or an integer)")]
    Invalid(String),
    /// The expression parses but never matches a real date (e.g. Feb 31).
    #[error("cron expression never matches a real date: {0}")]
    Unsatisfiable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Exact(u32),
}

impl Field {
    fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Exact(v) => v == value,
        }
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::Invalid(format!(
                "expected 5 fields, got {} in {expr:?}",
                fields.len()
            )));
        }

        let parse_field = |raw: &str, lo: u32, hi: u32, name: &str| -> Result<Field, CronError> {
            if raw == "*" {
                return Ok(Field::Any);
            }
            let value: u32 = raw.parse().map_err(|_| {
                CronError::Invalid(format!("{name} field {raw:?} is not `*` or an integer"))
            })?;
            if value < lo || value > hi {
                return Err(CronError::Invalid(format!(
                    "{name} field {value} out of range {lo}-{hi}"
                )));
            }
            Ok(Field::Exact(value))
        };

        Ok(Self {
            minute: parse_field(fields[0], 0, 59, "minute")?,
            hour: parse_field(fields[1], 0, 23, "hour")?,
            day_of_month: parse_field(fields[2], 1, 31, "day-of-month")?,
            month: parse_field(fields[3], 1, 12, "month")?,
            day_of_week: parse_field(fields[4], 0, 6, "day-of-week")?,
        })
    }

    /// The smallest `t > now` whose wall-clock decomposition (UTC) satisfies
    /// every specified field.  Strictly future: an expression that matches
    /// `now` exactly returns the following occurrence.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        // Truncate to the minute, then advance: candidates are whole minutes
        // strictly after `now`.
        let mut t = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), now.minute(), 0)
            .single()
            .ok_or_else(|| CronError::Unsatisfiable("current time not representable".into()))?
            + Duration::minutes(1);

        // Four years bounds every satisfiable expression (leap-day cases
        // included); anything still unmatched cannot match at all.
        let horizon = now + Duration::days(4 * 366);
        while t <= horizon {
            if !self.month.matches(t.month()) {
                // Jump to the first minute of the next month.
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc
                    .with_ymd_and_hms(y, m, 1, 0, 0, 0)
                    .single()
                    .ok_or_else(|| CronError::Unsatisfiable("date overflow".into()))?;
                continue;
            }
            if !self.day_of_month.matches(t.day())
                || !self.day_of_week.matches(t.weekday().num_days_from_sunday())
            {
                // Jump to midnight of the next day.
                let midnight = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()
                    .ok_or_else(|| CronError::Unsatisfiable("date overflow".into()))?;
                t = midnight + Duration::days(1);
                continue;
            }
            if !self.hour.matches(t.hour()) {
                let on_the_hour = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
                    .single()
                    .ok_or_else(|| CronError::Unsatisfiable("date overflow".into()))?;
                t = on_the_hour + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }

        Err(CronError::Unsatisfiable(
            "no match within four years".to_string(),
        ))
    }
}
