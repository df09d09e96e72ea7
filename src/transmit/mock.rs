//! Scripted transmitter for tests and demos.

use super::{Receipt, TransmitError, Transmitter};
use crate::config::Settings;
use crate::core::heartbeat::QueuedHeartbeat;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Transmitter that replays scripted outcomes and records every batch.
///
/// Once the script runs out, every send succeeds.
#[derive(Debug, Default)]
pub struct MockTransmitter {
    script: Mutex<VecDeque<Result<Receipt, TransmitError>>>,
    batches: Mutex<Vec<Vec<QueuedHeartbeat>>>,
    delivered: Mutex<Vec<QueuedHeartbeat>>,
    calls: AtomicUsize,
    /// How long each send takes
    latency: Mutex<Option<Duration>>,
}

impl MockTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up the outcome of the next unscripted send.
    pub fn push_outcome(&self, outcome: Result<Receipt, TransmitError>) -> &Self {
        lock(&self.script).push_back(outcome);
        self
    }

    /// Make the next `times` sends fail with `error`.
    pub fn fail_times(&self, times: usize, error: TransmitError) -> &Self {
        let mut script = lock(&self.script);
        for _ in 0..times {
            script.push_back(Err(error.clone()));
        }
        drop(script);
        self
    }

    /// Make every send take `latency` before it resolves.
    pub fn set_latency(&self, latency: Duration) -> &Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    /// Number of `send` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every batch passed to `send`, in call order.
    pub fn batches(&self) -> Vec<Vec<QueuedHeartbeat>> {
        lock(&self.batches).clone()
    }

    /// Entities of all heartbeats from sends that succeeded.
    pub fn delivered_entities(&self) -> Vec<String> {
        lock(&self.delivered)
            .iter()
            .map(|queued| queued.heartbeat.entity.clone())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transmitter for MockTransmitter {
    async fn send(
        &self,
        batch: &[QueuedHeartbeat],
        _settings: &Settings,
    ) -> Result<Receipt, TransmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.batches).push(batch.to_vec());

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Ok(Receipt::all_accepted()));
        if outcome.is_ok() {
            lock(&self.delivered).extend(batch.iter().cloned());
        }
        outcome
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityEvent;
    use crate::core::heartbeat::{Heartbeat, HeartbeatId};
    use crate::transmit::ErrorKind;

    fn batch(path: &str) -> Vec<QueuedHeartbeat> {
        vec![QueuedHeartbeat {
            id: HeartbeatId(1),
            heartbeat: Heartbeat::from_event(&ActivityEvent::edit(path)),
        }]
    }

    #[tokio::test]
    async fn test_script_then_success() {
        let mock = MockTransmitter::new();
        mock.fail_times(2, TransmitError::network("offline"));
        let settings = Settings::default();

        for _ in 0..2 {
            let error = mock.send(&batch("/a.rs"), &settings).await.unwrap_err();
            assert_eq!(error.kind, ErrorKind::Network);
        }
        assert!(mock.send(&batch("/b.rs"), &settings).await.is_ok());

        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.batches().len(), 3);
        assert_eq!(mock.delivered_entities(), vec!["/b.rs"]);
    }
}
