//! Retry decisions and backoff math.
//!
//! Pure functions over a [`RetryPolicy`]; the runtime owns the actual sleep
//! so these stay trivially testable.

use rand::Rng as _;
use std::time::Duration;

use crate::graphs::policies::{Backoff, RetryPolicy};
use crate::step::{ErrorClass, StepError};

/// Outcome of consulting a retry policy after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const STOP: Self = Self {
        retry: false,
        delay: Duration::ZERO,
    };
}

/// Decide whether attempt `attempt` (zero-based) should be retried.
///
/// Bug-class errors are never retried. A non-empty
/// `retryable_error_codes` list turns retry into an allow-list on the
/// error's code.
#[must_use]
pub fn evaluate(policy: &RetryPolicy, attempt: u32, error: &StepError) -> RetryDecision {
    if error.class == ErrorClass::Bug {
        return RetryDecision::STOP;
    }
    if attempt + 1 >= policy.max_attempts {
        return RetryDecision::STOP;
    }
    if !policy.retryable_error_codes.is_empty()
        && !policy.retryable_error_codes.iter().any(|c| c == &error.code)
    {
        return RetryDecision::STOP;
    }
    RetryDecision {
        retry: true,
        delay: delay_for(policy, attempt),
    }
}

/// Backoff delay before the retry that follows failed attempt `n`
/// (zero-based), clamped to `max_delay_ms` and then jittered.
#[must_use]
pub fn delay_for(policy: &RetryPolicy, n: u32) -> Duration {
    let base = policy.initial_delay_ms as f64;
    let raw = match policy.backoff {
        Backoff::Fixed => base,
        Backoff::Linear => base * f64::from(n + 1),
        Backoff::Exponential => base * 2f64.powi(n.min(63) as i32),
    };
    let clamped = raw.min(policy.max_delay_ms as f64);
    let jittered = apply_jitter(clamped, policy.jitter_fraction);
    Duration::from_millis(jittered.max(0.0) as u64)
}

fn apply_jitter(delay_ms: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 {
        return delay_ms;
    }
    // Uniform in [1 - f, 1 + f].
    let factor = 1.0 - fraction + rand::rng().random::<f64>() * 2.0 * fraction;
    delay_ms * factor
}
