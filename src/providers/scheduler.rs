//! Reminder scheduling with a one-second alarm monitor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use tokio::task::JoinHandle;

use crate::error::ProviderError;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Alarm fires only while `now` is inside `[time, time + ALARM_WINDOW)`.
const ALARM_WINDOW: TimeDelta = TimeDelta::seconds(2);
/// Completed events stay listed this long after their time.
const COMPLETED_RETENTION: TimeDelta = TimeDelta::hours(1);
const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Receives due reminders. Implementations show the notification and play the tone.
pub trait Notifier: Send + Sync {
    fn alarm(&self, event: &ScheduledEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alarm(&self, event: &ScheduledEvent) {
        tracing::info!(id = %event.id, title = %event.title, "reminder due");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub id: String,
    pub title: String,
    pub time: DateTime<Utc>,
    pub completed: bool,
}

impl ScheduledEvent {
    #[must_use]
    pub fn iso_time(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn display_time(&self) -> String {
        self.time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

pub struct Scheduler {
    events: Mutex<Vec<ScheduledEvent>>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with(Arc::new(SystemClock), Arc::new(LogNotifier))
    }

    #[must_use]
    pub fn with(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            clock,
            notifier,
        }
    }

    /// # Errors
    /// Returns [`ProviderError::InvalidTime`] if `iso_time` cannot be parsed,
    /// or [`ProviderError::EmptyTitle`] for a blank title.
    pub fn schedule_event(&self, title: &str, iso_time: &str) -> ProviderResult<String> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ProviderError::EmptyTitle);
        }
        let time = parse_time(iso_time)?;
        let event = ScheduledEvent {
            id: short_id(),
            title: title.to_string(),
            time,
            completed: false,
        };
        let confirmation = format!("Scheduled '{}' for {} (id: {})", event.title, event.display_time(), event.id);
        tracing::debug!(id = %event.id, time = %event.iso_time(), "event scheduled");

        let mut events = self.lock();
        events.push(event);
        events.sort_by_key(|e| e.time);
        Ok(confirmation)
    }

    /// Human-readable agenda, earliest first.
    #[must_use]
    pub fn list_events(&self) -> String {
        let now = self.clock.now();
        let events = self.lock();
        let lines: Vec<String> = events
            .iter()
            .filter(|e| !is_expired(e, now))
            .map(|e| {
                let status = if e.completed { "DONE" } else { "TODO" };
                format!("- [{status}] {} at {} (id: {})", e.title, e.display_time(), e.id)
            })
            .collect();

        if lines.is_empty() {
            "No scheduled events.".to_string()
        } else {
            format!("Scheduled events:\n{}", lines.join("\n"))
        }
    }

    /// Remove the event whose id equals `identifier`, or else the first whose
    /// title contains it case-insensitively.
    ///
    /// # Errors
    /// Returns [`ProviderError::EventNotFound`] when nothing matches.
    pub fn delete_event(&self, identifier: &str) -> ProviderResult<String> {
        let needle = identifier.trim().to_lowercase();
        if needle.is_empty() {
            return Err(ProviderError::EventNotFound);
        }
        let mut events = self.lock();
        let index = events
            .iter()
            .position(|e| e.id == identifier.trim())
            .or_else(|| events.iter().position(|e| e.title.to_lowercase().contains(&needle)))
            .ok_or(ProviderError::EventNotFound)?;
        let removed = events.remove(index);
        Ok(format!("Deleted event '{}'", removed.title))
    }

    #[must_use]
    pub fn events(&self) -> Vec<ScheduledEvent> {
        self.lock().clone()
    }

    /// One monitor step: complete and announce every event whose alarm window
    /// contains `now`, and forget completed events past retention. Returns the
    /// events that fired.
    pub fn tick(&self) -> Vec<ScheduledEvent> {
        let now = self.clock.now();
        let fired: Vec<ScheduledEvent> = {
            let mut events = self.lock();
            let fired: Vec<ScheduledEvent> = events
                .iter_mut()
                .filter(|e| !e.completed && now >= e.time && now < e.time + ALARM_WINDOW)
                .map(|e| {
                    e.completed = true;
                    e.clone()
                })
                .collect();
            events.retain(|e| !is_expired(e, now));
            fired
        };
        for event in &fired {
            self.notifier.alarm(event);
        }
        fired
    }

    /// Start the background monitor. It runs until the handle is dropped.
    #[must_use]
    pub fn start_monitor(self: &Arc<Self>) -> MonitorHandle {
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.tick();
            }
        });
        tracing::debug!("reminder monitor started");
        MonitorHandle { task }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the monitor task; dropping it stops the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_expired(event: &ScheduledEvent, now: DateTime<Utc>) -> bool {
    event.completed && now - event.time > COMPLETED_RETENTION
}

fn parse_time(raw: &str) -> ProviderResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }
    // Offset-less times are the user's wall clock.
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Ok(local.with_timezone(&Utc));
            }
        }
    }
    Err(ProviderError::InvalidTime(raw.to_string()))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
