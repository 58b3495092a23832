//! Reconnect policy for supervised broker connections
//!
//! The policy is a pure value: it answers "how long to wait before attempt N,
//! or should we give up". The supervisor owns the attempt counter and the
//! timer, so the schedule itself can be tested without sleeping.

use std::time::Duration;

/// Default reconnect ceiling
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt, capped at `max_delay`
    Exponential { max_delay: Duration },
}

/// Configuration for reconnect behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive failed reconnect attempts
    pub max_attempts: u32,
    /// Delay before the first attempt (and every attempt with fixed backoff)
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: initial_delay,
            backoff: Backoff::Exponential { max_delay },
        }
    }

    /// Delay to wait before reconnect attempt number `attempt` (1-based)
    ///
    /// Returns `None` once `attempt` exceeds the ceiling: the caller must stop
    /// retrying and surface a fatal state.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        match self.backoff {
            Backoff::Fixed => Some(self.delay),
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                let delay = self.delay.checked_mul(factor).unwrap_or(max_delay);
                Some(std::cmp::min(delay, max_delay))
            }
        }
    }
}
