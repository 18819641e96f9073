//! Retry policy: decides whether a failed task gets another attempt, and when.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::task::TaskRecord;
use crate::ports::JitterSource;

/// The retry verdict for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempts exhausted.
    Dead,
    /// Try again at this instant.
    RetryAt(DateTime<Utc>),
}

/// Exponential backoff with jitter.
///
/// `delay = min(max_delay, base_delay * 2^(attempt_count - 1)) * (1 ± jitter)`
///
/// Example with base_delay=2s, max_delay=60s, no jitter:
/// - attempt 1: 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
/// - attempt 6: 60s (capped)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Fraction in `[0, 1)`; 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Backoff before jitter, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(62) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Backoff with jitter applied. `draw` is a uniform sample in `[0, 1)`;
    /// 0.5 yields the nominal delay.
    pub fn delay(&self, attempt_count: u32, draw: f64) -> Duration {
        let draw = if draw.is_finite() { draw.clamp(0.0, 1.0) } else { 0.5 };
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * draw - 1.0);
        let nominal = self.nominal_delay(attempt_count);
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor).unwrap_or(nominal)
    }

    /// Decide the fate of a task whose latest attempt failed.
    ///
    /// `task.attempt_count` already includes the failed attempt.
    pub fn next_attempt(
        &self,
        task: &TaskRecord,
        now: DateTime<Utc>,
        jitter: &dyn JitterSource,
    ) -> RetryDecision {
        if task.attempts_exhausted() {
            return RetryDecision::Dead;
        }
        let draw = jitter.draw(task.id, task.attempt_count);
        let delay = self.delay(task.attempt_count, draw);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::RetryAt(at)
    }
}
