//! Exponential backoff for transient delivery failures.
//!
//! Delays double from `base` up to `max`, with a random spread of
//! `±jitter` so many agents coming back online do not retry in lockstep.
//! There is no retry limit: a batch is retried until it is delivered.

use crate::config::duration_serde;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Shape of the retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    #[serde(with = "duration_serde")]
    pub base: Duration,
    /// Upper bound on any delay
    #[serde(with = "duration_serde")]
    pub max: Duration,
    /// Fractional spread applied to each delay, 0.0..1.0
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    /// 15s base, doubling, capped at 10 minutes, ±20%.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            max: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before retry number `attempt` (0 = first retry), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay with jitter applied, still capped at `max`.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rng.gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("backoff base must be positive".into());
        }
        if self.max < self.base {
            return Err("backoff max must not be below base".into());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("backoff jitter must be in [0, 1)".into());
        }
        Ok(())
    }
}

/// Tracks consecutive transient failures and when the next retry is due.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            retry_at: None,
        }
    }

    /// Record a failure at `now`; returns the delay until the next attempt.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = self
            .policy
            .jittered_delay(self.failures, &mut rand::thread_rng());
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + delay);
        delay
    }

    /// Clear the failure streak.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether an attempt may be made at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Time left until the next attempt is allowed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.retry_at.map(|at| at.saturating_duration_since(now))
    }
}
