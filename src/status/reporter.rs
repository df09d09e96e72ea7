//! Delivery status exposed to the editor integration.
//!
//! The dispatcher publishes a [`DeliveryStatus`] after every attempt through
//! a [`StatusReporter`]. Integrations render it however they like, e.g.
//! "last heartbeat sent at T" or "authentication failing since T".

use crate::transmit::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// An ongoing delivery failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    /// First failure of the current streak
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub message: String,
}

/// What the dispatcher last knew about delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    /// Last time a batch was acknowledged
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Heartbeats still waiting in the queue
    pub pending: usize,
    /// Current failure, if delivery is failing
    pub error: Option<StatusError>,
}

impl DeliveryStatus {
    pub fn is_auth_failing(&self) -> bool {
        matches!(
            self.error,
            Some(StatusError {
                kind: ErrorKind::Auth,
                ..
            })
        )
    }

    /// Record a failure, keeping the streak's start time if the kind matches.
    pub fn record_failure(&mut self, kind: ErrorKind, message: String, at: DateTime<Utc>) {
        match self.error {
            Some(ref mut error) if error.kind == kind => {
                error.consecutive_failures += 1;
                error.message = message;
            }
            _ => {
                self.error = Some(StatusError {
                    kind,
                    since: at,
                    consecutive_failures: 1,
                    message,
                });
            }
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_sent_at = Some(at);
        self.error = None;
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref error) = self.error {
            write!(
                f,
                "{} failing since {}",
                error.kind,
                error.since.format("%Y-%m-%d %H:%M:%S UTC")
            )?;
            if error.consecutive_failures > 1 {
                write!(f, " ({} attempts)", error.consecutive_failures)?;
            }
        } else if let Some(at) = self.last_sent_at {
            write!(f, "last heartbeat sent at {}", at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        } else {
            write!(f, "no heartbeats sent yet")?;
        }
        write!(f, ", {} pending", self.pending)
    }
}

/// Sink for delivery status updates.
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: &DeliveryStatus);
}

/// Keeps the latest status in memory and optionally mirrors it to disk.
#[derive(Debug, Default)]
pub struct SharedStatus {
    current: RwLock<DeliveryStatus>,
    persist_path: Option<PathBuf>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status that is also written to `path` on every update.
    pub fn with_persistence(path: PathBuf) -> Self {
        Self {
            current: RwLock::new(DeliveryStatus::default()),
            persist_path: Some(path),
        }
    }

    /// The most recently reported status.
    pub fn current(&self) -> DeliveryStatus {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Read a status file written by another process.
    pub fn load_file(path: &std::path::Path) -> Result<DeliveryStatus, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    fn persist(&self, status: &DeliveryStatus) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(status).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

impl StatusReporter for SharedStatus {
    fn report(&self, status: &DeliveryStatus) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status.clone();

        if let Err(e) = self.persist(status) {
            tracing::warn!("could not write status file: {e}");
        }
    }
}

/// Thread-safe shared status.
pub type SharedStatusHandle = Arc<SharedStatus>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_failure_streak_keeps_since() {
        let first = Utc::now();
        let mut status = DeliveryStatus::default();
        status.record_failure(ErrorKind::Auth, "bad key".into(), first);
        status.record_failure(ErrorKind::Auth, "bad key".into(), first + Duration::seconds(30));

        let error = status.error.as_ref().unwrap();
        assert_eq!(error.since, first);
        assert_eq!(error.consecutive_failures, 2);
        assert!(status.is_auth_failing());
    }

    #[test]
    fn test_kind_change_restarts_streak() {
        let first = Utc::now();
        let later = first + Duration::seconds(60);
        let mut status = DeliveryStatus::default();
        status.record_failure(ErrorKind::Network, "offline".into(), first);
        status.record_failure(ErrorKind::Auth, "bad key".into(), later);

        let error = status.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Auth);
        assert_eq!(error.since, later);
        assert_eq!(error.consecutive_failures, 1);
    }

    #[test]
    fn test_success_clears_error() {
        let mut status = DeliveryStatus::default();
        status.record_failure(ErrorKind::Server, "503".into(), Utc::now());
        let at = Utc::now();
        status.record_success(at);
        assert!(status.error.is_none());
        assert_eq!(status.last_sent_at, Some(at));
        assert!(status.to_string().starts_with("last heartbeat sent at"));
    }

    #[test]
    fn test_display_auth_failure() {
        let mut status = DeliveryStatus::default();
        status.record_failure(ErrorKind::Auth, "bad key".into(), Utc::now());
        status.pending = 3;
        let text = status.to_string();
        assert!(text.starts_with("auth failing since"));
        assert!(text.ends_with("3 pending"));
    }

    #[test]
    fn test_shared_status_persists() {
        let dir = std::env::temp_dir().join(format!("heartbeat-status-{}", uuid::Uuid::new_v4()));
        let path = dir.join("status.json");
        let shared = SharedStatus::with_persistence(path.clone());

        let mut status = DeliveryStatus::default();
        status.pending = 4;
        shared.report(&status);

        assert_eq!(shared.current().pending, 4);
        assert_eq!(SharedStatus::load_file(&path).unwrap().pending, 4);

        let _ = std::fs::remove_dir_all(dir);
    }
}
