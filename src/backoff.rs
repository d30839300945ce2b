//! Capped exponential backoff with jitter
//!
//! Shared by the forwarder (after a failed delivery) and the control channel
//! (between reconnect attempts). Delays grow as `base * 2^attempt`, are capped
//! at `max`, and are then scaled by a random factor in `[0.5, 1.0]` so a fleet
//! of gateways recovering from the same outage does not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to the base delay
const MAX_EXPONENT: u32 = 20;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Disable jitter (deterministic delays, mainly for tests)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Capped delay before jitter for the given zero-based attempt
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32 << attempt.min(MAX_EXPONENT);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }

        let nanos = u64::try_from(capped.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(nanos / 2..=nanos))
    }
}

/// Consecutive-failure counter on top of a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the current failure streak, then extend the streak.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget the failure streak after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
