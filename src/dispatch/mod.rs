//! Delivery dispatcher.
//!
//! A single task that drains the queue through a [`Transmitter`]. It wakes
//! on a fixed cadence, when the queue goes from empty to non-empty, on a
//! settings reload, and on shutdown. Heartbeats leave the queue only after
//! the transmitter acknowledges them.
//!
//! Failure handling:
//! - network and server errors back off exponentially and retry forever
//! - authentication errors halt delivery until settings are reloaded
//! - heartbeats refused as malformed are acknowledged and counted

pub mod backoff;

use crate::config::Settings;
use crate::queue::SharedQueue;
use crate::status::{DeliveryStatus, SharedStats, StatusReporter};
use crate::transmit::{ErrorKind, Transmitter};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub use backoff::{Backoff, BackoffPolicy};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// A batch was acknowledged
    Delivered { sent: usize, rejected: usize },
    /// A transient failure; the batch stays queued for `delay`
    Retrying { delay: Duration },
    /// Backing off from an earlier failure; nothing was sent
    Waiting { remaining: Duration },
    /// The API key was rejected; delivery is halted until a reload
    AuthHalted,
}

/// Totals of a drain of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub rejected: usize,
    /// Why draining stopped
    pub outcome: FlushOutcome,
}

/// Dispatcher tuning taken from the configuration.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            flush_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<&crate::config::Config> for DispatcherOptions {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            shutdown_timeout: config.shutdown_timeout,
            backoff: config.backoff.clone(),
        }
    }
}

/// Drains the heartbeat queue through a transmitter.
pub struct Dispatcher {
    queue: SharedQueue,
    transmitter: Arc<dyn Transmitter>,
    reporter: Arc<dyn StatusReporter>,
    stats: SharedStats,
    settings: Settings,
    options: DispatcherOptions,
    backoff: Backoff,
    status: DeliveryStatus,
    auth_halted: bool,
}

impl Dispatcher {
    pub fn new(
        queue: SharedQueue,
        transmitter: Arc<dyn Transmitter>,
        reporter: Arc<dyn StatusReporter>,
        stats: SharedStats,
        settings: Settings,
        options: DispatcherOptions,
    ) -> Self {
        let backoff = Backoff::new(options.backoff.clone());
        Self {
            queue,
            transmitter,
            reporter,
            stats,
            settings,
            options: DispatcherOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            backoff,
            status: DeliveryStatus::default(),
            auth_halted: false,
        }
    }

    /// Latest published status.
    pub fn status(&self) -> &DeliveryStatus {
        &self.status
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_auth_halted(&self) -> bool {
        self.auth_halted
    }

    /// Apply new settings. Re-arms delivery after an auth halt and skips
    /// any pending backoff so the new settings are tried right away.
    pub fn reload(&mut self, settings: Settings) {
        tracing::info!(
            api_url = settings.api_url(),
            has_key = settings.api_key().is_some(),
            "delivery settings reloaded"
        );
        self.settings = settings;
        if self.auth_halted {
            tracing::info!("re-arming delivery after authentication failure");
            self.auth_halted = false;
        }
        self.backoff.reset();
    }

    /// Make one delivery attempt, honoring backoff and auth halts.
    pub async fn attempt_once(&mut self) -> FlushOutcome {
        self.attempt(false).await
    }

    /// Deliver batches until the queue is empty or an attempt does not succeed.
    pub async fn flush(&mut self) -> FlushReport {
        self.drain(false).await
    }

    /// Final best-effort flush, bounded by `timeout` and ignoring backoff.
    ///
    /// Whatever is not delivered stays in the queue's journal.
    pub async fn shutdown_flush(&mut self, timeout: Duration) -> Option<FlushReport> {
        let report = if self.auth_halted || self.queue.is_empty() {
            None
        } else {
            match tokio::time::timeout(timeout, self.drain(true)).await {
                Ok(report) => Some(report),
                Err(_) => {
                    tracing::warn!(
                        pending = self.queue.len(),
                        "final flush timed out, heartbeats kept for next start"
                    );
                    None
                }
            }
        };

        if let Err(e) = self.queue.sync() {
            tracing::warn!("could not sync queue journal: {e}");
        }
        report
    }

    /// Run until `shutdown` turns true, then make a final flush.
    ///
    /// New settings arriving on `settings` are applied as an explicit reload.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut settings: watch::Receiver<Settings>,
    ) {
        let queue = self.queue.clone();
        let mut settings_open = true;

        tracing::info!(
            transmitter = self.transmitter.name(),
            pending = queue.len(),
            "dispatcher started"
        );
        self.status.pending = queue.len();
        self.publish();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.flush().await;
            if report.sent > 0 || report.rejected > 0 {
                tracing::info!(
                    sent = report.sent,
                    rejected = report.rejected,
                    pending = queue.len(),
                    "delivered heartbeats"
                );
            }

            let wait = match report.outcome {
                FlushOutcome::Retrying { delay } => delay,
                FlushOutcome::Waiting { remaining } => remaining,
                _ => self.options.flush_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = queue.wait_for_work() => {}
                changed = settings.changed(), if settings_open => {
                    match changed {
                        Ok(()) => {
                            let next = settings.borrow_and_update().clone();
                            self.reload(next);
                        }
                        Err(_) => settings_open = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let timeout = self.options.shutdown_timeout;
        if let Some(report) = self.shutdown_flush(timeout).await {
            tracing::info!(sent = report.sent, "final flush complete");
        }
        tracing::info!(pending = queue.len(), "dispatcher stopped");
    }

    async fn drain(&mut self, force: bool) -> FlushReport {
        let mut sent = 0;
        let mut rejected = 0;
        loop {
            match self.attempt(force).await {
                FlushOutcome::Delivered {
                    sent: batch_sent,
                    rejected: batch_rejected,
                } => {
                    sent += batch_sent;
                    rejected += batch_rejected;
                }
                outcome => {
                    return FlushReport {
                        sent,
                        rejected,
                        outcome,
                    }
                }
            }
        }
    }

    async fn attempt(&mut self, force: bool) -> FlushOutcome {
        if self.auth_halted {
            return FlushOutcome::AuthHalted;
        }
        let now = Instant::now();
        if !force && !self.backoff.is_ready(now) {
            return FlushOutcome::Waiting {
                remaining: self.backoff.remaining(now).unwrap_or_default(),
            };
        }

        let batch = self.queue.peek_batch(self.options.batch_size);
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let result = self.transmitter.send(&batch, &self.settings).await;

        let outcome = match result {
            Ok(receipt) => {
                let ids: Vec<_> = batch.iter().map(|queued| queued.id).collect();
                let refused: HashSet<_> = receipt.rejected.iter().copied().collect();
                let rejected = batch.iter().filter(|q| refused.contains(&q.id)).count();
                let sent = batch.len() - rejected;

                self.queue.acknowledge(&ids);
                self.stats.record_sent(sent as u64);
                if rejected > 0 {
                    tracing::warn!(rejected, "service refused malformed heartbeats");
                    self.stats.record_rejected(rejected as u64);
                }
                self.backoff.reset();
                self.status.record_success(Utc::now());
                FlushOutcome::Delivered { sent, rejected }
            }
            Err(error) => {
                self.stats.record_failed_attempt();
                self.status
                    .record_failure(error.kind, error.message.clone(), Utc::now());

                match error.kind {
                    ErrorKind::Auth => {
                        tracing::warn!(
                            transmitter = self.transmitter.name(),
                            "{error}; halting delivery until settings are reloaded"
                        );
                        self.auth_halted = true;
                        FlushOutcome::AuthHalted
                    }
                    ErrorKind::Malformed => {
                        tracing::warn!(
                            count = batch.len(),
                            "{error}; dropping batch that cannot be delivered"
                        );
                        let ids: Vec<_> = batch.iter().map(|queued| queued.id).collect();
                        self.queue.acknowledge(&ids);
                        self.stats.record_rejected(batch.len() as u64);
                        self.backoff.reset();
                        FlushOutcome::Delivered {
                            sent: 0,
                            rejected: batch.len(),
                        }
                    }
                    ErrorKind::Network | ErrorKind::Server => {
                        let delay = self.backoff.record_failure(Instant::now());
                        tracing::warn!(
                            retry_in_secs = delay.as_secs(),
                            attempt = self.backoff.failures(),
                            "{error}"
                        );
                        FlushOutcome::Retrying { delay }
                    }
                }
            }
        };

        self.status.pending = self.queue.len();
        self.publish();
        outcome
    }

    fn publish(&self) {
        self.reporter.report(&self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityEvent;
    use crate::core::heartbeat::Heartbeat;
    use crate::queue::HeartbeatQueue;
    use crate::status::{DeliveryStats, SharedStatus};
    use crate::transmit::{MockTransmitter, Receipt, TransmitError};

    struct Harness {
        queue: SharedQueue,
        mock: Arc<MockTransmitter>,
        status: Arc<SharedStatus>,
        stats: SharedStats,
        dispatcher: Dispatcher,
    }

    fn harness(batch_size: usize) -> Harness {
        let queue = Arc::new(HeartbeatQueue::in_memory(100));
        let mock = Arc::new(MockTransmitter::new());
        let status = Arc::new(SharedStatus::new());
        let stats = Arc::new(DeliveryStats::new());
        let options = DispatcherOptions {
            batch_size,
            backoff: BackoffPolicy::new(Duration::from_secs(15), Duration::from_secs(600), 0.0),
            ..DispatcherOptions::default()
        };
        let dispatcher = Dispatcher::new(
            queue.clone(),
            mock.clone(),
            status.clone(),
            stats.clone(),
            Settings::default(),
            options,
        );
        Harness {
            queue,
            mock,
            status,
            stats,
            dispatcher,
        }
    }

    fn enqueue(queue: &SharedQueue, names: &[&str]) {
        for name in names {
            queue.enqueue(Heartbeat::from_event(&ActivityEvent::edit(*name)));
        }
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let mut h = harness(25);
        assert_eq!(h.dispatcher.attempt_once().await, FlushOutcome::Empty);
        assert_eq!(h.mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_in_batches() {
        let mut h = harness(2);
        enqueue(&h.queue, &["a", "b", "c", "d", "e"]);

        let report = h.dispatcher.flush().await;
        assert_eq!(report.sent, 5);
        assert_eq!(report.outcome, FlushOutcome::Empty);
        assert!(h.queue.is_empty());
        assert_eq!(h.mock.calls(), 3);
        assert_eq!(h.mock.delivered_entities(), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(h.stats.snapshot().heartbeats_sent, 5);
        assert!(h.status.current().last_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_queue_and_backs_off() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a", "b"]);
        h.mock.fail_times(1, TransmitError::network("offline"));

        let outcome = h.dispatcher.attempt_once().await;
        assert_eq!(
            outcome,
            FlushOutcome::Retrying {
                delay: Duration::from_secs(15)
            }
        );
        assert_eq!(h.queue.len(), 2);

        // backing off: no new call is made
        assert!(matches!(
            h.dispatcher.attempt_once().await,
            FlushOutcome::Waiting { .. }
        ));
        assert_eq!(h.mock.calls(), 1);

        let current = h.status.current();
        assert_eq!(current.pending, 2);
        assert_eq!(current.error.map(|e| e.kind), Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_retry_delays_double() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a"]);
        h.mock.fail_times(3, TransmitError::server("503"));

        let mut delays = Vec::new();
        for _ in 0..3 {
            if let FlushOutcome::Retrying { delay } = h.dispatcher.attempt(true).await {
                delays.push(delay.as_secs());
            }
        }
        assert_eq!(delays, vec![15, 30, 60]);

        // the queue is delivered once the service recovers
        let report = h.dispatcher.drain(true).await;
        assert_eq!(report.sent, 1);
        assert!(h.status.current().error.is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_halts_until_reload() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a"]);
        h.mock.fail_times(2, TransmitError::auth("invalid api key"));

        assert_eq!(h.dispatcher.attempt_once().await, FlushOutcome::AuthHalted);
        let since = h.status.current().error.unwrap().since;

        // halted: further attempts do not reach the transmitter
        assert_eq!(h.dispatcher.attempt_once().await, FlushOutcome::AuthHalted);
        assert_eq!(h.mock.calls(), 1);

        // reload with the same bad key continues the streak
        h.dispatcher.reload(Settings::default());
        assert_eq!(h.dispatcher.attempt_once().await, FlushOutcome::AuthHalted);
        let error = h.status.current().error.unwrap();
        assert_eq!(error.since, since);
        assert_eq!(error.consecutive_failures, 2);
        assert_eq!(h.queue.len(), 1);

        // a good key delivers
        h.dispatcher.reload(Settings {
            api_key: Some("waka_good".into()),
            ..Settings::default()
        });
        let report = h.dispatcher.flush().await;
        assert_eq!(report.sent, 1);
        assert!(!h.dispatcher.is_auth_halted());
        assert!(h.status.current().error.is_none());
    }

    #[tokio::test]
    async fn test_rejected_heartbeats_are_acknowledged() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a", "b", "c"]);
        let bad = h.queue.peek_batch(3)[1].id;
        h.mock.push_outcome(Ok(Receipt {
            rejected: vec![bad],
        }));

        assert_eq!(
            h.dispatcher.attempt_once().await,
            FlushOutcome::Delivered {
                sent: 2,
                rejected: 1
            }
        );
        assert!(h.queue.is_empty());
        assert_eq!(h.stats.snapshot().heartbeats_rejected, 1);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_dropped() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a", "b"]);
        h.mock
            .fail_times(1, TransmitError::malformed("bad payload"));

        let report = h.dispatcher.flush().await;
        assert_eq!(report.rejected, 2);
        assert_eq!(report.sent, 0);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flush_is_bounded() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a", "b", "c"]);
        h.mock.set_latency(Duration::from_secs(30));

        let started = Instant::now();
        let report = h
            .dispatcher
            .shutdown_flush(Duration::from_millis(100))
            .await;

        assert!(report.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.mock.calls(), 1);
        assert_eq!(h.queue.len(), 3);
        assert!(h.mock.delivered_entities().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flush_ignores_backoff() {
        let mut h = harness(25);
        enqueue(&h.queue, &["a"]);
        h.mock.fail_times(1, TransmitError::network("offline"));
        assert!(matches!(
            h.dispatcher.attempt_once().await,
            FlushOutcome::Retrying { .. }
        ));

        let report = h
            .dispatcher
            .shutdown_flush(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_delivers_and_stops() {
        let h = harness(25);
        let queue = h.queue.clone();
        let mock = h.mock.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_settings_tx, settings_rx) = watch::channel(Settings::default());

        let task = tokio::spawn(h.dispatcher.run(shutdown_rx, settings_rx));
        enqueue(&queue, &["a", "b"]);

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mock.delivered_entities(), vec!["a", "b"]);
    }
}
