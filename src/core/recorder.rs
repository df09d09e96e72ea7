//! Producer side of the pipeline: activity in, queued heartbeats out.

use crate::activity::ActivityEvent;
use crate::core::debounce::{Decision, Debouncer};
use crate::queue::{EnqueueOutcome, SharedQueue};
use crate::status::SharedStats;

/// Runs the debouncer on the producer's thread and enqueues what it emits.
///
/// Recording never waits on delivery and never fails; everything that
/// happens to an event ends up in the shared statistics.
pub struct ActivityRecorder {
    debouncer: Debouncer,
    queue: SharedQueue,
    stats: SharedStats,
}

impl ActivityRecorder {
    pub fn new(debouncer: Debouncer, queue: SharedQueue, stats: SharedStats) -> Self {
        Self {
            debouncer,
            queue,
            stats,
        }
    }

    /// Feed one activity event through the debouncer.
    ///
    /// Returns the enqueue outcome when the event became a heartbeat.
    pub fn record(&mut self, event: &ActivityEvent) -> Option<EnqueueOutcome> {
        self.stats.record_event();

        match self.debouncer.decide(event) {
            Decision::Emit(heartbeat) => {
                self.stats.record_emitted();
                let outcome = self.queue.enqueue(heartbeat);
                if outcome.dropped > 0 {
                    self.stats.record_overflow(outcome.dropped as u64);
                }
                Some(outcome)
            }
            Decision::Suppressed => {
                self.stats.record_suppressed();
                None
            }
            Decision::Malformed => {
                self.stats.record_malformed();
                None
            }
        }
    }

    /// Apply a reloaded heartbeat interval.
    pub fn set_interval(&mut self, interval_secs: u64) {
        if interval_secs != self.debouncer.interval_secs() {
            tracing::info!(interval_secs, "heartbeat interval changed");
            self.debouncer.set_interval(interval_secs);
        }
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::HeartbeatQueue;
    use crate::status::DeliveryStats;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn recorder(cap: usize) -> ActivityRecorder {
        ActivityRecorder::new(
            Debouncer::new(120, 3600),
            Arc::new(HeartbeatQueue::in_memory(cap)),
            Arc::new(DeliveryStats::new()),
        )
    }

    fn edit(path: &str, secs: i64) -> ActivityEvent {
        ActivityEvent::edit(path).at(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    #[test]
    fn test_records_every_decision() {
        let mut recorder = recorder(100);
        recorder.record(&edit("a.rs", 0));
        recorder.record(&edit("a.rs", 10));
        recorder.record(&edit("", 11));
        recorder.record(&edit("b.rs", 12));

        let stats = recorder.stats.snapshot();
        assert_eq!(stats.events_received, 4);
        assert_eq!(stats.heartbeats_emitted, 2);
        assert_eq!(stats.heartbeats_suppressed, 1);
        assert_eq!(stats.malformed_dropped, 1);
        assert_eq!(recorder.queue().len(), 2);
    }

    #[test]
    fn test_overflow_is_counted() {
        let mut recorder = recorder(2);
        for (i, path) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            recorder.record(&edit(path, i as i64));
        }
        assert_eq!(recorder.stats.snapshot().overflow_dropped, 1);
        assert_eq!(recorder.queue().len(), 2);
    }

    #[test]
    fn test_set_interval() {
        let mut recorder = recorder(100);
        recorder.set_interval(30);
        assert_eq!(recorder.debouncer().interval_secs(), 30);
    }
}
