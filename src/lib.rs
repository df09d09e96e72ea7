//! Editor Heartbeat - activity debouncing and durable delivery for time tracking.
//!
//! This library turns the stream of activity events an editor plugin
//! produces into rate-limited heartbeats and delivers them to a
//! time-tracking service, surviving network outages and restarts.
//!
//! # Delivery Guarantees
//!
//! - **At least once**: heartbeats leave the queue only when acknowledged
//! - **Durable**: unsent heartbeats are journaled and restored on restart
//! - **Non-blocking**: recording activity never waits on the network
//! - **Observable**: delivery status and counters are always available
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Editor Heartbeat                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Activity   │──▶│  Debouncer  │──▶│    Queue    │         │
//! │  │ stdin/HTTP  │   │ (per file)  │   │  (journal)  │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │                                             │                │
//! │                                             ▼                │
//! │  ┌─────────────┐                     ┌─────────────┐         │
//! │  │   Status    │◀────────────────────│ Dispatcher  │──▶ CLI  │
//! │  │  & Stats    │                     │  (backoff)  │         │
//! │  └─────────────┘                     └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use editor_heartbeat::{activity::ActivityEvent, core::Debouncer};
//!
//! let mut debouncer = Debouncer::default();
//! let event = ActivityEvent::edit("/home/dev/project/src/main.rs");
//!
//! if let Some(heartbeat) = debouncer.evaluate(&event) {
//!     println!("heartbeat for {}", heartbeat.entity);
//! }
//! ```

pub mod activity;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod queue;
pub mod status;
pub mod transmit;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use activity::{ActivityEvent, Category, LineSource};
pub use config::{Config, ConfigError, Settings};
pub use core::{ActivityRecorder, Debouncer, Heartbeat, HeartbeatId, QueuedHeartbeat};
pub use dispatch::{Dispatcher, DispatcherOptions, FlushOutcome, FlushReport};
pub use queue::{HeartbeatQueue, QueueError, SharedQueue};
pub use status::{DeliveryStats, DeliveryStatus, SharedStats, SharedStatus, StatusReporter};
pub use transmit::{CliTransmitter, ErrorKind, MockTransmitter, TransmitError, Transmitter};

// HTTP transmitter re-export (when enabled)
#[cfg(feature = "http")]
pub use transmit::HttpTransmitter;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin identifier reported to the tracking service, e.g.
/// `vscode/1.89.0 editor-heartbeat/0.1.0`.
pub fn plugin_id(editor: &str) -> String {
    if editor.trim().is_empty() {
        format!("editor-heartbeat/{VERSION}")
    } else {
        format!("{} editor-heartbeat/{VERSION}", editor.trim())
    }
}
