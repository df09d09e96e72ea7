//! Cumulative delivery counters.
//!
//! Counters are updated from both the producer path and the dispatcher, so
//! they are plain atomics. They can be persisted between runs so the
//! `status` command shows totals across sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters describing what the agent has done with activity so far.
#[derive(Debug)]
pub struct DeliveryStats {
    /// Activity events received from the source
    events_received: AtomicU64,
    /// Events dropped for lacking a file path
    malformed_dropped: AtomicU64,
    /// Heartbeats produced by the debouncer
    heartbeats_emitted: AtomicU64,
    /// Events the debouncer collapsed
    heartbeats_suppressed: AtomicU64,
    /// Heartbeats acknowledged by the transmitter
    heartbeats_sent: AtomicU64,
    /// Heartbeats the service rejected as malformed
    heartbeats_rejected: AtomicU64,
    /// Heartbeats shed by the queue's soft cap
    overflow_dropped: AtomicU64,
    /// Transmission attempts that failed
    failed_attempts: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            heartbeats_emitted: AtomicU64::new(0),
            heartbeats_suppressed: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_rejected: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that resume from, and save to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("could not load previous delivery stats: {e}");
        }

        stats
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.heartbeats_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.heartbeats_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, count: u64) {
        self.heartbeats_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, count: u64) {
        self.heartbeats_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_overflow(&self, count: u64) {
        self.overflow_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            heartbeats_emitted: self.heartbeats_emitted.load(Ordering::Relaxed),
            heartbeats_suppressed: self.heartbeats_suppressed.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_rejected: self.heartbeats_rejected.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Summary for display.
    pub fn summary(&self) -> String {
        self.snapshot().to_string()
    }

    /// Save counters to disk, if persistence is configured.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let snapshot = self.snapshot();
            let persisted = PersistedStats {
                events_received: snapshot.events_received,
                malformed_dropped: snapshot.malformed_dropped,
                heartbeats_emitted: snapshot.heartbeats_emitted,
                heartbeats_suppressed: snapshot.heartbeats_suppressed,
                heartbeats_sent: snapshot.heartbeats_sent,
                heartbeats_rejected: snapshot.heartbeats_rejected,
                overflow_dropped: snapshot.overflow_dropped,
                failed_attempts: snapshot.failed_attempts,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.events_received
                    .store(persisted.events_received, Ordering::Relaxed);
                self.malformed_dropped
                    .store(persisted.malformed_dropped, Ordering::Relaxed);
                self.heartbeats_emitted
                    .store(persisted.heartbeats_emitted, Ordering::Relaxed);
                self.heartbeats_suppressed
                    .store(persisted.heartbeats_suppressed, Ordering::Relaxed);
                self.heartbeats_sent
                    .store(persisted.heartbeats_sent, Ordering::Relaxed);
                self.heartbeats_rejected
                    .store(persisted.heartbeats_rejected, Ordering::Relaxed);
                self.overflow_dropped
                    .store(persisted.overflow_dropped, Ordering::Relaxed);
                self.failed_attempts
                    .store(persisted.failed_attempts, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub malformed_dropped: u64,
    pub heartbeats_emitted: u64,
    pub heartbeats_suppressed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_rejected: u64,
    pub overflow_dropped: u64,
    pub failed_attempts: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Delivery Statistics:\n\
             - Activity events received: {}\n\
             - Malformed events dropped: {}\n\
             - Heartbeats emitted: {}\n\
             - Heartbeats suppressed: {}\n\
             - Heartbeats sent: {}\n\
             - Heartbeats rejected: {}\n\
             - Heartbeats shed by queue cap: {}\n\
             - Failed delivery attempts: {}\n\
             - Session duration: {} seconds",
            self.events_received,
            self.malformed_dropped,
            self.heartbeats_emitted,
            self.heartbeats_suppressed,
            self.heartbeats_sent,
            self.heartbeats_rejected,
            self.overflow_dropped,
            self.failed_attempts,
            self.session_duration_secs
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    events_received: u64,
    malformed_dropped: u64,
    heartbeats_emitted: u64,
    heartbeats_suppressed: u64,
    heartbeats_sent: u64,
    heartbeats_rejected: u64,
    overflow_dropped: u64,
    failed_attempts: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared stats.
pub type SharedStats = Arc<DeliveryStats>;
