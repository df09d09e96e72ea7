//! Core functionality for the heartbeat agent.
//!
//! This module contains:
//! - Heartbeat records and their wire form
//! - Per-file debouncing of activity into heartbeats
//! - The recorder that feeds emitted heartbeats into the queue

pub mod debounce;
pub mod heartbeat;
pub mod recorder;

// Re-export commonly used types
pub use debounce::{Decision, Debouncer, DEFAULT_HEARTBEAT_INTERVAL_SECS};
pub use heartbeat::{Heartbeat, HeartbeatId, QueuedHeartbeat, WireHeartbeat};
pub use recorder::ActivityRecorder;
