//! Per-file heartbeat debouncing.
//!
//! Editors report activity on every keystroke. The debouncer collapses
//! that stream into heartbeats: one per file per interval, plus one
//! whenever the developer switches files or flips between editing and
//! saving.

use crate::activity::ActivityEvent;
use crate::core::heartbeat::Heartbeat;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Default minimum spacing of heartbeats for the same file.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 120;

/// Files untouched for this long are forgotten.
pub const DEFAULT_IDLE_WINDOW_SECS: u64 = 3600;

/// Outcome of evaluating one activity event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The event produced a heartbeat
    Emit(Heartbeat),
    /// Same file, same write state, interval not yet elapsed
    Suppressed,
    /// The event lacked a file path and was dropped
    Malformed,
}

impl Decision {
    pub fn into_heartbeat(self) -> Option<Heartbeat> {
        match self {
            Decision::Emit(heartbeat) => Some(heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FileState {
    last_sent: DateTime<Utc>,
    was_write: bool,
}

/// Decides which activity events are heartbeat-worthy.
pub struct Debouncer {
    interval: Duration,
    idle_window: Duration,
    files: HashMap<String, FileState>,
    /// File of the most recent heartbeat
    last_entity: Option<String>,
    last_prune: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(interval_secs: u64, idle_window_secs: u64) -> Self {
        Self {
            interval: seconds(interval_secs),
            idle_window: seconds(idle_window_secs),
            files: HashMap::new(),
            last_entity: None,
            last_prune: None,
        }
    }

    /// Apply a reloaded heartbeat interval. Recorded state is kept.
    pub fn set_interval(&mut self, interval_secs: u64) {
        self.interval = seconds(interval_secs);
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval.num_seconds() as u64
    }

    /// Return the heartbeat for `event`, if it deserves one.
    pub fn evaluate(&mut self, event: &ActivityEvent) -> Option<Heartbeat> {
        self.decide(event).into_heartbeat()
    }

    /// Evaluate an event, reporting why it was or wasn't emitted.
    ///
    /// The event's own timestamp is "now", so replayed or batched events
    /// are debounced by when they happened rather than when they arrived.
    pub fn decide(&mut self, event: &ActivityEvent) -> Decision {
        if event.is_malformed() {
            tracing::warn!("dropping activity event without a file path");
            return Decision::Malformed;
        }

        let now = event.timestamp;
        self.maybe_prune(now);

        let path = event.file_path.as_str();
        let state = self.files.get(path).copied();

        let write_flipped = state.is_some_and(|s| s.was_write != event.is_write);
        let file_switched = self.last_entity.as_deref() != Some(path);
        let interval_elapsed = state.map_or(true, |s| now - s.last_sent >= self.interval);

        if !(write_flipped || file_switched || interval_elapsed) {
            tracing::debug!(file = path, "heartbeat suppressed, interval not reached");
            return Decision::Suppressed;
        }

        tracing::debug!(
            file = path,
            write_flipped,
            file_switched,
            interval_elapsed,
            "emitting heartbeat"
        );

        self.files.insert(
            path.to_string(),
            FileState {
                last_sent: now,
                was_write: event.is_write,
            },
        );
        if file_switched {
            self.last_entity = Some(path.to_string());
        }

        Decision::Emit(Heartbeat::from_event(event))
    }

    /// Forget files idle for longer than the idle window.
    pub fn prune_idle(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.files.len();
        let idle_window = self.idle_window;
        self.files.retain(|_, state| now - state.last_sent <= idle_window);
        before - self.files.len()
    }

    /// Number of files with recorded debounce state.
    pub fn tracked_files(&self) -> usize {
        self.files.len()
    }

    fn maybe_prune(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_prune
            .map_or(true, |last| now - last >= self.idle_window);
        if due {
            let pruned = self.prune_idle(now);
            if pruned > 0 {
                tracing::debug!(pruned, "pruned idle debounce entries");
            }
            self.last_prune = Some(now);
        }
    }
}

/// Seconds as a chrono duration, saturating instead of overflowing.
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_IDLE_WINDOW_SECS)
    }
}
