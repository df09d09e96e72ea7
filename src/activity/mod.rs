//! Activity intake for the heartbeat agent.
//!
//! This module defines the raw activity signals an editor integration
//! produces and a line-oriented source that reads them from a pipe.

pub mod source;
pub mod types;

pub use source::{LineSource, SourceError};
pub use types::{ActivityEvent, Category};
