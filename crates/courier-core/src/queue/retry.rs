//! Retry policy: attempt budget and backoff delays.

use std::time::Duration;

/// Longest backoff we will ever schedule.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,

    Fixed(Duration),

    /// `base * 2^(attempts - 1)`.
    Exponential { base: Duration },
}

/// Retry policy for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// One execution, no retries.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn exponential(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::Exponential { base },
        }
    }

    /// Delay before the next attempt, given how many have been made (1-indexed).
    ///
    /// With base=2s: attempt 1 -> 2s, attempt 2 -> 4s, attempt 3 -> 8s.
    pub fn next_delay(&self, attempts_made: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay.min(MAX_BACKOFF),
            Backoff::Exponential { base } => {
                let exponent = attempts_made.saturating_sub(1).min(63) as i32;
                let secs = base.as_secs_f64() * 2f64.powi(exponent);
                Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
