//! Reconnect delay computation.
//!
//! [`BackoffPolicy`] maps the number of consecutive failed connection attempts held in
//! a [`BackoffState`] to the delay before the next attempt. The base delay is derived
//! from the attempt count alone, clamped to `max_delay`, and only then perturbed by
//! [`JitterPolicy`]. Jitter output never feeds back into later delays.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the base delay grows with each failed attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Growth {
    /// `base_delay × (attempt + 1)`
    Linear,
    /// `base_delay × factor^attempt`
    Exponential { factor: f64 },
}

/// Randomisation applied to a computed delay so that many clients sharing one
/// schedule do not reconnect in lockstep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Exact delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2 + uniform[0, delay/2]`.
    Equal,
}

impl JitterPolicy {
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }

        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

/// Count of consecutive failed connection attempts.
///
/// Owned and mutated by the connection supervisor only: incremented after each
/// failed attempt and reset once a channel is open and every listener accepted it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub attempt_count: u32,
}

impl BackoffState {
    pub fn record_failure(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub growth: Growth,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth: Growth::Exponential { factor: 2.0 },
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            growth: Growth::Linear,
            jitter: JitterPolicy::None,
        }
    }

    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before the next attempt given the failures recorded so far.
    ///
    /// `attempt_count == 0` yields `base_delay` (clamped to `max_delay`), never the cap.
    pub fn next_delay(&self, state: &BackoffState) -> Duration {
        let attempt = state.attempt_count.min(i32::MAX as u32);
        let base_secs = self.base_delay.as_secs_f64();
        let unclamped_secs = match self.growth {
            Growth::Linear => base_secs * (f64::from(attempt) + 1.0),
            Growth::Exponential { factor } => base_secs * factor.max(1.0).powi(attempt as i32),
        };

        let max_secs = self.max_delay.as_secs_f64();
        let base = if !unclamped_secs.is_finite() || unclamped_secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(unclamped_secs.max(0.0))
        };

        self.jitter.apply(base)
    }

    pub fn reset(&self, state: &mut BackoffState) {
        state.attempt_count = 0;
    }
}
