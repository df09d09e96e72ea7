//! Durable FIFO of heartbeats awaiting delivery.
//!
//! The queue is the only state shared between the producer (the debouncer
//! on the editor's thread) and the dispatcher task. Heartbeats leave it
//! only when acknowledged or when the soft cap sheds the oldest ones;
//! peeking never removes anything.

pub mod store;

use crate::core::heartbeat::{Heartbeat, HeartbeatId, QueuedHeartbeat};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

pub use store::{JournalRecord, QueueError, QueueStore, Replay, Snapshot};

/// Default number of pending heartbeats kept before shedding the oldest.
pub const DEFAULT_SOFT_CAP: usize = 10_000;

/// Extra journal records tolerated before compaction.
const COMPACTION_SLACK: usize = 1_000;

/// Result of adding a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: HeartbeatId,
    /// Oldest heartbeats shed to stay under the soft cap
    pub dropped: usize,
    /// The queue was empty before this heartbeat
    pub was_empty: bool,
}

struct QueueInner {
    pending: VecDeque<QueuedHeartbeat>,
    next_id: u64,
    store: Option<QueueStore>,
    /// Records journaled while a compaction snapshot is being written
    compaction_tail: Option<Vec<JournalRecord>>,
}

/// State captured to write a compacted journal outside the lock.
struct CompactionPlan {
    path: PathBuf,
    next_id: u64,
    pending: Vec<QueuedHeartbeat>,
}

impl QueueInner {
    fn journal(&mut self, record: &JournalRecord) {
        if let Some(ref mut store) = self.store {
            if let Err(e) = store.append(record) {
                tracing::warn!("queue journal write failed, keeping heartbeat in memory: {e}");
            }
            if let Some(ref mut tail) = self.compaction_tail {
                tail.push(record.clone());
            }
        }
    }

    /// Start a compaction if the journal has grown well past the pending set.
    fn plan_compaction(&mut self) -> Option<CompactionPlan> {
        if self.compaction_tail.is_some() {
            return None;
        }
        let store = self.store.as_ref()?;
        if store.records() <= self.pending.len() * 2 + COMPACTION_SLACK {
            return None;
        }
        let plan = CompactionPlan {
            path: store.snapshot_path(),
            next_id: self.next_id,
            pending: self.pending.iter().cloned().collect(),
        };
        self.compaction_tail = Some(Vec::new());
        Some(plan)
    }
}

/// Thread-safe heartbeat queue.
pub struct HeartbeatQueue {
    inner: Mutex<QueueInner>,
    soft_cap: usize,
    wake: Notify,
}

impl HeartbeatQueue {
    /// Queue without persistence.
    pub fn in_memory(soft_cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                next_id: 0,
                store: None,
                compaction_tail: None,
            }),
            soft_cap: soft_cap.max(1),
            wake: Notify::new(),
        }
    }

    /// Queue backed by the journal at `path`, restoring unsent heartbeats.
    pub fn open(path: &Path, soft_cap: usize) -> Result<Self, QueueError> {
        let (store, replay) = QueueStore::open(path)?;
        let restored = replay.pending.len();
        if restored > 0 {
            tracing::info!(restored, "restored unsent heartbeats from journal");
        }

        let queue = Self {
            inner: Mutex::new(QueueInner {
                pending: replay.pending.into(),
                next_id: replay.next_id,
                store: Some(store),
                compaction_tail: None,
            }),
            soft_cap: soft_cap.max(1),
            wake: Notify::new(),
        };
        queue.compact_if_needed(queue.lock());

        if restored > 0 {
            queue.wake.notify_one();
        }
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a heartbeat. Never blocks on delivery; sheds the oldest
    /// heartbeats once the soft cap is exceeded.
    pub fn enqueue(&self, heartbeat: Heartbeat) -> EnqueueOutcome {
        let mut inner = self.lock();

        let id = HeartbeatId(inner.next_id);
        inner.next_id += 1;
        let was_empty = inner.pending.is_empty();

        inner.journal(&JournalRecord::Enqueue {
            id,
            heartbeat: heartbeat.clone(),
        });
        inner.pending.push_back(QueuedHeartbeat { id, heartbeat });

        let mut shed = Vec::new();
        while inner.pending.len() > self.soft_cap {
            if let Some(oldest) = inner.pending.pop_front() {
                shed.push(oldest.id);
            }
        }
        let dropped = shed.len();
        if dropped > 0 {
            tracing::warn!(dropped, cap = self.soft_cap, "queue over soft cap, shed oldest heartbeats");
            inner.journal(&JournalRecord::Ack { ids: shed });
        }
        self.compact_if_needed(inner);

        if was_empty {
            self.wake.notify_one();
        }

        EnqueueOutcome {
            id,
            dropped,
            was_empty,
        }
    }

    /// Up to `max` oldest heartbeats, left in place.
    pub fn peek_batch(&self, max: usize) -> Vec<QueuedHeartbeat> {
        self.lock().pending.iter().take(max).cloned().collect()
    }

    /// Remove the given heartbeats. Unknown ids are ignored.
    ///
    /// Returns how many heartbeats were removed.
    pub fn acknowledge(&self, ids: &[HeartbeatId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let wanted: HashSet<HeartbeatId> = ids.iter().copied().collect();

        let mut inner = self.lock();
        let mut removed = Vec::new();
        inner.pending.retain(|queued| {
            if wanted.contains(&queued.id) {
                removed.push(queued.id);
                false
            } else {
                true
            }
        });

        let count = removed.len();
        if count > 0 {
            inner.journal(&JournalRecord::Ack { ids: removed });
            self.compact_if_needed(inner);
        }
        count
    }

    /// Compact the journal when it is due. The snapshot is written with the
    /// lock released; records journaled meanwhile are appended to it before
    /// it replaces the live journal.
    fn compact_if_needed(&self, mut inner: MutexGuard<'_, QueueInner>) {
        let Some(plan) = inner.plan_compaction() else {
            return;
        };
        drop(inner);

        let written = Snapshot::write(&plan.path, plan.next_id, plan.pending.iter());

        let mut inner = self.lock();
        let tail = inner.compaction_tail.take().unwrap_or_default();
        let installed = match (written, inner.store.as_mut()) {
            (Ok(snapshot), Some(store)) => store.install(snapshot, &tail),
            (Ok(_), None) => Ok(()),
            (Err(e), _) => Err(e),
        };
        if let Err(e) = installed {
            tracing::warn!("queue journal compaction failed: {e}");
        }
    }

    /// Records in the backing journal, if there is one.
    pub fn journal_records(&self) -> Option<usize> {
        self.lock().store.as_ref().map(QueueStore::records)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn soft_cap(&self) -> usize {
        self.soft_cap
    }

    /// Wait until the queue goes from empty to non-empty.
    ///
    /// A transition that happened while nobody was waiting is remembered,
    /// so the dispatcher cannot miss one between checks.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// Flush the journal to disk.
    pub fn sync(&self) -> Result<(), QueueError> {
        match self.lock().store {
            Some(ref store) => store.sync(),
            None => Ok(()),
        }
    }
}

/// Queue shared between producer and dispatcher.
pub type SharedQueue = Arc<HeartbeatQueue>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityEvent;
    use std::path::PathBuf;

    fn heartbeat(path: &str) -> Heartbeat {
        Heartbeat::from_event(&ActivityEvent::edit(path))
    }

    fn entities(batch: &[QueuedHeartbeat]) -> Vec<String> {
        batch.iter().map(|q| q.heartbeat.entity.clone()).collect()
    }

    fn temp_path() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("heartbeat-queue-{}", uuid::Uuid::new_v4()));
        let path = dir.join("queue.jsonl");
        (dir, path)
    }

    #[test]
    fn test_fifo_order() {
        let queue = HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP);
        for name in ["e1", "e2", "e3", "e4"] {
            queue.enqueue(heartbeat(name));
        }
        assert_eq!(entities(&queue.peek_batch(4)), vec!["e1", "e2", "e3", "e4"]);
        assert_eq!(entities(&queue.peek_batch(2)), vec!["e1", "e2"]);
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let queue = HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP);
        queue.enqueue(heartbeat("a"));
        queue.peek_batch(10);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_batch(10).len(), 1);
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let queue = HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP);
        let a = queue.enqueue(heartbeat("a")).id;
        queue.enqueue(heartbeat("b"));

        assert_eq!(queue.acknowledge(&[a]), 1);
        let once = queue.peek_batch(10);
        assert_eq!(queue.acknowledge(&[a]), 0);
        assert_eq!(queue.peek_batch(10), once);
        assert_eq!(entities(&once), vec!["b"]);
    }

    #[test]
    fn test_acknowledge_unknown_id_is_noop() {
        let queue = HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP);
        queue.enqueue(heartbeat("a"));
        assert_eq!(queue.acknowledge(&[HeartbeatId(999)]), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_soft_cap_sheds_oldest() {
        let queue = HeartbeatQueue::in_memory(3);
        for name in ["a", "b", "c"] {
            assert_eq!(queue.enqueue(heartbeat(name)).dropped, 0);
        }
        let outcome = queue.enqueue(heartbeat("d"));
        assert_eq!(outcome.dropped, 1);
        assert_eq!(entities(&queue.peek_batch(10)), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_was_empty_flag() {
        let queue = HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP);
        let first = queue.enqueue(heartbeat("a"));
        let second = queue.enqueue(heartbeat("b"));
        assert!(first.was_empty);
        assert!(!second.was_empty);
        assert!(second.id > first.id);
    }

    #[test]
    fn test_restart_keeps_unacknowledged() {
        let (dir, path) = temp_path();
        {
            let queue = HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap();
            for name in ["a", "b", "c", "d"] {
                queue.enqueue(heartbeat(name));
            }
            let first = queue.peek_batch(1)[0].id;
            queue.acknowledge(&[first]);
        }

        let queue = HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap();
        assert_eq!(entities(&queue.peek_batch(10)), vec!["b", "c", "d"]);

        // ids keep increasing across restarts
        let next = queue.enqueue(heartbeat("e")).id;
        assert_eq!(next, HeartbeatId(4));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_shed_heartbeats_stay_gone_after_restart() {
        let (dir, path) = temp_path();
        {
            let queue = HeartbeatQueue::open(&path, 2).unwrap();
            for name in ["a", "b", "c"] {
                queue.enqueue(heartbeat(name));
            }
        }
        let queue = HeartbeatQueue::open(&path, 2).unwrap();
        assert_eq!(entities(&queue.peek_batch(10)), vec!["b", "c"]);

        let _ = std::fs::remove_dir_all(dir);
    }

    fn journal_lines(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn test_shedding_keeps_journal_bounded() {
        let (dir, path) = temp_path();
        {
            let queue = HeartbeatQueue::open(&path, 10).unwrap();
            for i in 0..5_000 {
                queue.enqueue(heartbeat(&format!("hb{i}")));
            }
            assert_eq!(queue.len(), 10);

            let bound = 10 * 2 + COMPACTION_SLACK + 2;
            assert!(queue.journal_records().unwrap() <= bound);
            assert!(journal_lines(&path) <= bound);
        }

        let queue = HeartbeatQueue::open(&path, 10).unwrap();
        let restored = entities(&queue.peek_batch(20));
        assert_eq!(restored.len(), 10);
        assert_eq!(restored[0], "hb4990");
        assert_eq!(restored[9], "hb4999");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_acknowledging_compacts_journal() {
        let (dir, path) = temp_path();
        {
            let queue = HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap();
            for i in 0..1_200 {
                queue.enqueue(heartbeat(&format!("hb{i}")));
            }
            while queue.len() > 10 {
                let ids: Vec<_> = queue.peek_batch(10).iter().map(|q| q.id).collect();
                queue.acknowledge(&ids);
            }
            assert!(journal_lines(&path) < 200);
            assert_eq!(queue.journal_records(), Some(journal_lines(&path)));
        }

        let queue = HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap();
        let restored = queue.peek_batch(20);
        assert_eq!(restored.len(), 10);
        assert_eq!(restored[0].id, HeartbeatId(1_190));
        assert_eq!(restored[0].heartbeat.entity, "hb1190");
        assert_eq!(queue.enqueue(heartbeat("next")).id, HeartbeatId(1_200));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_compaction_during_enqueue_keeps_journal_consistent() {
        let (dir, path) = temp_path();
        let expected: Vec<HeartbeatId> = {
            let queue = Arc::new(HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap());
            let producer = {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..3_000 {
                        queue.enqueue(heartbeat(&format!("hb{i}")));
                    }
                })
            };
            while !producer.is_finished() || queue.len() > 5 {
                let ids: Vec<_> = queue.peek_batch(7).iter().map(|q| q.id).collect();
                queue.acknowledge(&ids);
            }
            producer.join().unwrap();
            queue.peek_batch(DEFAULT_SOFT_CAP).iter().map(|q| q.id).collect()
        };

        let queue = HeartbeatQueue::open(&path, DEFAULT_SOFT_CAP).unwrap();
        let restored: Vec<HeartbeatId> = queue.peek_batch(DEFAULT_SOFT_CAP).iter().map(|q| q.id).collect();
        assert_eq!(restored, expected);
        assert_eq!(queue.enqueue(heartbeat("next")).id, HeartbeatId(3_000));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(HeartbeatQueue::in_memory(DEFAULT_SOFT_CAP));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.enqueue(heartbeat(&format!("t{t}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let batch = queue.peek_batch(2_000);
        assert_eq!(batch.len(), 1_000);
        // ids come out in the order they were assigned
        assert!(batch.windows(2).all(|w| w[0].id < w[1].id));
    }
}
