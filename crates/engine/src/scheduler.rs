//! Day-of-week + time-of-day scheduler. Walks due triggers on a one-minute
//! tick and issues a scheduled start-irrigation to whatever is listening
//! (the engine's command surface), exactly as if the start had arrived from
//! the transport adapter.
//!
//! ```text
//! tick (every 60s) ──▶ for each (plant, entry) due this minute
//!                        ──▶ sink.trigger_scheduled_irrigation(plant_id)
//! ```
//!
//! Operates in the local timezone of the device clock; no catch-up after
//! downtime, no daylight-saving adjustment beyond what the local clock itself
//! performs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const TICK_INTERVAL_SEC: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    fn from_time_weekday(w: time::Weekday) -> Self {
        match w {
            time::Weekday::Sunday => Weekday::Sunday,
            time::Weekday::Monday => Weekday::Monday,
            time::Weekday::Tuesday => Weekday::Tuesday,
            time::Weekday::Wednesday => Weekday::Wednesday,
            time::Weekday::Thursday => Weekday::Thursday,
            time::Weekday::Friday => Weekday::Friday,
            time::Weekday::Saturday => Weekday::Saturday,
        }
    }
}

/// Normalize a free-form day name ("sun", "Sunday", "MON", ...) to the
/// canonical `Weekday`. Unrecognized input returns `None` — invalid entries
/// are dropped, not raised.
pub fn normalize_day(raw: &str) -> Option<Weekday> {
    match raw.trim().to_lowercase().as_str() {
        "sun" | "sunday" => Some(Weekday::Sunday),
        "mon" | "monday" => Some(Weekday::Monday),
        "tue" | "tues" | "tuesday" => Some(Weekday::Tuesday),
        "wed" | "weds" | "wednesday" => Some(Weekday::Wednesday),
        "thu" | "thur" | "thurs" | "thursday" => Some(Weekday::Thursday),
        "fri" | "friday" => Some(Weekday::Friday),
        "sat" | "saturday" => Some(Weekday::Saturday),
        _ => None,
    }
}

/// Normalize a free-form time string `H[H]:M[M][:S[S]]` to zero-padded
/// `(hour, minute)`, discarding seconds. Invalid entries return `None`.
pub fn normalize_time(raw: &str) -> Option<(u8, u8)> {
    let mut parts = raw.trim().split(':');
    let hour: u8 = parts.next()?.trim().parse().ok()?;
    let minute: u8 = parts.next()?.trim().parse().ok()?;
    // A third `:SS` component, if present, is simply ignored.
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub day: Weekday,
    pub hour: u8,
    pub minute: u8,
}

impl ScheduleEntry {
    /// Build an entry from free-form `(day, hh:mm)` strings, normalizing
    /// both. Returns `None` if either is unparseable.
    pub fn normalize(day: &str, time_str: &str) -> Option<Self> {
        let day = normalize_day(day)?;
        let (hour, minute) = normalize_time(time_str)?;
        Some(ScheduleEntry { day, hour, minute })
    }
}

/// Implemented by whatever owns the command surface (the Engine), so the
/// scheduler can fire triggers without depending on engine internals.
pub trait ScheduleTrigger: Send + Sync {
    fn trigger_scheduled_irrigation(&self, plant_id: i64);
    fn plant_exists(&self, plant_id: i64) -> bool;
}

pub struct Scheduler {
    /// plant_id -> its active trigger set. Replacing a plant's schedule
    /// overwrites the whole Vec atomically so there is never a window with
    /// triggers from both the old and new set (P9).
    triggers: AsyncMutex<HashMap<i64, Vec<ScheduleEntry>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            triggers: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn set_schedule(&self, plant_id: i64, entries: Vec<ScheduleEntry>) {
        let mut triggers = self.triggers.lock().await;
        if entries.is_empty() {
            triggers.remove(&plant_id);
        } else {
            triggers.insert(plant_id, entries);
        }
    }

    pub async fn remove_plant(&self, plant_id: i64) {
        self.triggers.lock().await.remove(&plant_id);
    }

    #[cfg(test)]
    pub async fn entries_for(&self, plant_id: i64) -> Vec<ScheduleEntry> {
        self.triggers
            .lock()
            .await
            .get(&plant_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Run the minute-granularity tick loop. Intended to be `tokio::spawn`-ed
    /// once at startup; runs until the process exits.
    pub async fn run(&self, sink: Arc<dyn ScheduleTrigger>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
        info!(tick_sec = TICK_INTERVAL_SEC, "scheduler started");

        loop {
            ticker.tick().await;
            let now = OffsetDateTime::now_utc();
            let today = Weekday::from_time_weekday(now.weekday());
            let hour = now.hour();
            let minute = now.minute();

            let mut stale_plants = Vec::new();
            let due_plants: Vec<i64> = {
                let triggers = self.triggers.lock().await;
                let mut due = Vec::new();
                for (&plant_id, entries) in triggers.iter() {
                    if !sink.plant_exists(plant_id) {
                        stale_plants.push(plant_id);
                        continue;
                    }
                    let fires = entries
                        .iter()
                        .any(|e| e.day == today && e.hour == hour && e.minute == minute);
                    if fires {
                        due.push(plant_id);
                    }
                }
                due
            };

            if !stale_plants.is_empty() {
                let mut triggers = self.triggers.lock().await;
                for plant_id in stale_plants {
                    warn!(plant_id, "pruning schedule for plant that no longer exists");
                    triggers.remove(&plant_id);
                }
            }

            for plant_id in due_plants {
                debug!(plant_id, "scheduled trigger fired");
                sink.trigger_scheduled_irrigation(plant_id);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
