//! Reminder scheduling: a single wall-clock alarm over the mixed set of
//! cron and one-shot reminders.
//!
//! The scheduler holds no state of its own — every decision is recomputed
//! from the Reminder table, so a restart only needs one [`Scheduler::reschedule`]
//! call to pick up where the previous process left off.  The decision logic
//! lives in pure functions ([`plan_next_alarm`], [`scan_due`]) with the tokio
//! timer task kept as thin as possible around them.

pub mod cron;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use minder_memory::schema::Millis;
use minder_memory::{Reminder, Schedule, Store, StoreError, with_retry};

pub use cron::{CronError, CronExpr};

/// A due reminder may fire up to this many ms late, and never earlier than
/// this many ms before its time.
pub const FIRE_WINDOW_MS: i64 = 60_000;
/// A one-shot older than this with no firing opportunity is dropped.
pub const MISS_WINDOW_MS: i64 = 60_000;

/// Next time `reminder` wants to fire, or `None` when its cron expression is
/// invalid or can never match (such reminders simply never schedule).
pub fn next_fire_time(reminder: &Reminder, now: Millis) -> Option<Millis> {
    match &reminder.schedule {
        Schedule::At(t) => Some(*t),
        Schedule::Cron(expr) => {
            let parsed = match CronExpr::parse(expr) {
                Ok(p) => p,
                Err(err) => {
                    warn!(id = %reminder.id, %err, "skipping reminder with invalid cron expression");
                    return None;
                }
            };
            let now_dt = Utc.timestamp_millis_opt(now).single()?;
            match parsed.next_fire(now_dt) {
                Ok(t) => Some(t.timestamp_millis()),
                Err(err) => {
                    warn!(id = %reminder.id, %err, "skipping unsatisfiable cron reminder");
                    None
                }
            }
        }
    }
}

/// The earliest fire time across `reminders` — where the single alarm goes.
/// `None` clears the alarm.
pub fn plan_next_alarm(reminders: &[Reminder], now: Millis) -> Option<Millis> {
    reminders
        .iter()
        .filter_map(|r| next_fire_time(r, now))
        .min()
}

/// Outcome of one alarm epoch over the reminder set.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Reminders inside the fire window, to dispatch this epoch.
    pub fire: Vec<Reminder>,
    /// One-shot reminder ids whose window passed with no firing opportunity.
    pub missed: Vec<String>,
}

/// Classify every reminder against `now`: missed one-shots are dropped,
/// reminders within ±[`FIRE_WINDOW_MS`] fire, everything else is left alone.
pub fn scan_due(reminders: &[Reminder], now: Millis) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    for reminder in reminders {
        let Some(t) = next_fire_time(reminder, now) else {
            continue;
        };
        if reminder.is_one_shot() && t < now - MISS_WINDOW_MS {
            outcome.missed.push(reminder.id.clone());
        } else if (t - now).abs() <= FIRE_WINDOW_MS {
            outcome.fire.push(reminder.clone());
        }
    }
    outcome
}

fn now_ms() -> Millis {
    Utc::now().timestamp_millis()
}

struct Inner {
    store: Arc<Store>,
    fired_tx: mpsc::Sender<Reminder>,
    /// The installed alarm: its wall-clock target and the timer task.
    alarm: Mutex<Option<(Millis, JoinHandle<()>)>>,
}

/// Owns the single wall-clock alarm.  Cheap to clone; all clones share the
/// alarm slot.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, fired_tx: mpsc::Sender<Reminder>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fired_tx,
                alarm: Mutex::new(None),
            }),
        }
    }

    /// Recompute `min(next_fire_time)` and install a single alarm there.  Any
    /// prior alarm is replaced; an empty reminder set clears the alarm.  A
    /// second call with no intervening mutation is a no-op.
    pub fn reschedule(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.reschedule_inner())
    }

    async fn reschedule_inner(&self) -> Result<(), StoreError> {
        let store = self.inner.store.clone();
        let reminders = with_retry(|| store.list_reminders()).await?;
        let next = plan_next_alarm(&reminders, now_ms());

        let mut slot = self.inner.alarm.lock().await;
        if let Some((armed_at, handle)) = slot.as_ref() {
            if Some(*armed_at) == next && !handle.is_finished() {
                debug!(at = armed_at, "alarm already installed — reschedule is a no-op");
                return Ok(());
            }
        }
        if let Some((_, handle)) = slot.take() {
            handle.abort();
        }

        let Some(target) = next else {
            debug!("no reminders — alarm cleared");
            return Ok(());
        };

        let delay_ms = (target - now_ms()).max(0) as u64;
        info!(at = target, in_ms = delay_ms, "alarm installed");
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            // Drop our own slot entry before scanning so the reschedule at
            // the end of on_alarm never aborts the task that is running it.
            {
                let mut slot = scheduler.inner.alarm.lock().await;
                *slot = None;
            }
            if let Err(err) = scheduler.on_alarm().await {
                warn!(%err, "alarm scan failed");
            }
        });
        *slot = Some((target, handle));
        Ok(())
    }

    /// One alarm epoch: clean up missed one-shots, dispatch due reminders
    /// (one-shots are deleted *before* dispatch so a crashed dispatch can
    /// never double-fire), then re-arm.
    pub async fn on_alarm(&self) -> Result<(), StoreError> {
        let store = self.inner.store.clone();
        let reminders = with_retry(|| store.list_reminders()).await?;
        let outcome = scan_due(&reminders, now_ms());

        for id in &outcome.missed {
            info!(%id, "one-shot reminder missed its window — deleting");
            let store = store.clone();
            let id = id.clone();
            with_retry(move || store.delete_reminder(&id)).await?;
        }

        for reminder in outcome.fire {
            if reminder.is_one_shot() {
                let store = store.clone();
                let id = reminder.id.clone();
                with_retry(move || store.delete_reminder(&id)).await?;
            }
            info!(id = %reminder.id, description = %reminder.description, "reminder fired");
            if self.inner.fired_tx.send(reminder).await.is_err() {
                warn!("alarm receiver dropped — reminder dispatch lost");
            }
        }

        self.reschedule().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_shot(id: &str, at: Millis) -> Reminder {
        Reminder {
            id: id.to_string(),
            description: format!("reminder {id}"),
            payload: "payload".to_string(),
            created_at: 0,
            schedule: Schedule::At(at),
        }
    }

    fn recurring(id: &str, expr: &str) -> Reminder {
        Reminder {
            id: id.to_string(),
            description: format!("reminder {id}"),
            payload: "payload".to_string(),
            created_at: 0,
            schedule: Schedule::Cron(expr.to_string()),
        }
    }

    #[test]
    fn plan_picks_the_earliest_fire_time() {
        let now = 1_000_000;
        let reminders = vec![one_shot("late", now + 500_000), one_shot("soon", now + 10_000)];
        assert_eq!(plan_next_alarm(&reminders, now), Some(now + 10_000));
        assert_eq!(plan_next_alarm(&[], now), None);
    }

    #[test]
    fn invalid_cron_never_schedules() {
        let reminders = vec![recurring("bad", "*/5 * * * *")];
        assert_eq!(plan_next_alarm(&reminders, 1_000_000), None);
    }

    #[test]
    fn scan_fires_within_window_in_both_directions() {
        let now = 10_000_000;
        let reminders = vec![
            one_shot("just-passed", now - 30_000),
            one_shot("imminent", now + 30_000),
            one_shot("far", now + 600_000),
        ];
        let outcome = scan_due(&reminders, now);
        let fired: Vec<&str> = outcome.fire.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(fired, vec!["just-passed", "imminent"]);
        assert!(outcome.missed.is_empty());
    }

    #[test]
    fn scan_drops_missed_one_shots() {
        let now = 10_000_000;
        let reminders = vec![one_shot("stale", now - 600_000)];
        let outcome = scan_due(&reminders, now);
        assert!(outcome.fire.is_empty());
        assert_eq!(outcome.missed, vec!["stale".to_string()]);
    }

    #[test]
    fn exactly_now_is_fire_now() {
        let now = 10_000_000;
        let outcome = scan_due(&[one_shot("now", now)], now);
        assert_eq!(outcome.fire.len(), 1);
    }

    #[test]
    fn recurring_outside_window_is_left_alone() {
        // A daily 09:00 reminder evaluated far from 09:00 neither fires nor
        // is dropped.
        let now = Utc
            .with_ymd_and_hms(2026, 3, 10, 3, 0, 0)
            .unwrap()
            .timestamp_millis();
        let outcome = scan_due(&[recurring("daily", "0 9 * * *")], now);
        assert!(outcome.fire.is_empty());
        assert!(outcome.missed.is_empty());
    }

    #[tokio::test]
    async fn on_alarm_deletes_one_shot_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.redb")).unwrap());
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(store.clone(), tx);

        store.save_reminder(&one_shot("r1", now_ms())).unwrap();
        scheduler.on_alarm().await.unwrap();

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.id, "r1");
        // Deleted before dispatch: by the time anyone sees the trigger the
        // row is gone.
        assert!(store.list_reminders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_alarm_cleans_missed_one_shot_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.redb")).unwrap());
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(store.clone(), tx);

        store
            .save_reminder(&one_shot("old", now_ms() - 10 * 60_000))
            .unwrap();
        scheduler.on_alarm().await.unwrap();

        assert!(store.list_reminders().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reschedule_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.redb")).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(store.clone(), tx);

        store
            .save_reminder(&one_shot("r1", now_ms() + 3_600_000))
            .unwrap();
        scheduler.reschedule().await.unwrap();
        let first = scheduler.inner.alarm.lock().await.as_ref().map(|(t, _)| *t);
        scheduler.reschedule().await.unwrap();
        let second = scheduler.inner.alarm.lock().await.as_ref().map(|(t, _)| *t);
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn empty_set_clears_the_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.redb")).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(store.clone(), tx);

        store
            .save_reminder(&one_shot("r1", now_ms() + 3_600_000))
            .unwrap();
        scheduler.reschedule().await.unwrap();
        assert!(scheduler.inner.alarm.lock().await.is_some());

        store.delete_reminder("r1").unwrap();
        scheduler.reschedule().await.unwrap();
        assert!(scheduler.inner.alarm.lock().await.is_none());
    }
}
