//! Delivery of heartbeat batches to the tracking service.
//!
//! The dispatcher only sees the [`Transmitter`] trait. The production
//! implementation shells out to the heartbeat CLI; an HTTP implementation
//! is available behind the `http` feature, and [`MockTransmitter`] serves
//! tests.

pub mod cli;
pub mod mock;

#[cfg(feature = "http")]
pub mod http;

use crate::config::Settings;
use crate::core::heartbeat::{HeartbeatId, QueuedHeartbeat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use cli::CliTransmitter;
pub use mock::MockTransmitter;

#[cfg(feature = "http")]
pub use http::HttpTransmitter;

/// Classification of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Service unreachable, offline, or rate limited
    Network,
    /// API key missing or rejected
    Auth,
    /// Service answered with an error
    Server,
    /// Service refused the payload itself
    Malformed,
}

impl ErrorKind {
    /// Whether waiting and retrying the same batch can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Server)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Server => write!(f, "server"),
            ErrorKind::Malformed => write!(f, "malformed"),
        }
    }
}

/// A batch-level delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransmitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }
}

impl std::fmt::Display for TransmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transmit {} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransmitError {}

/// Per-heartbeat result of an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    /// Heartbeats the service refused as malformed; everything else was accepted
    pub rejected: Vec<HeartbeatId>,
}

impl Receipt {
    pub fn all_accepted() -> Self {
        Self::default()
    }
}

/// Line count of the file behind a heartbeat, when it is readable.
pub async fn lines_in_file(path: &str) -> Option<u64> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|content| content.lines().count() as u64)
        .filter(|&count| count > 0)
}

/// Something that can deliver a batch of heartbeats.
#[async_trait]
pub trait Transmitter: Send + Sync {
    async fn send(
        &self,
        batch: &[QueuedHeartbeat],
        settings: &Settings,
    ) -> Result<Receipt, TransmitError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
