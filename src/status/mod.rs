//! Status and statistics for the heartbeat agent.
//!
//! This module tracks what happened to activity (counters) and where
//! delivery currently stands (status), for display by the integration.

pub mod reporter;
pub mod stats;

pub use reporter::{DeliveryStatus, SharedStatus, SharedStatusHandle, StatusError, StatusReporter};
pub use stats::{DeliveryStats, SharedStats, StatsSnapshot};
