//! Per-step execution policies: retry, timeout, caching, scoring, and
//! declared state access.
//!
//! Policies attach only to leaf `Step` nodes. All durations are plain
//! millisecond fields so the whole graph stays serde-friendly for external
//! parsers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Delay strategy applied between retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Retry behavior for a failing step attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first attempt. Must be >= 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay_ms: u64,
    /// Upper clamp applied before jitter.
    pub max_delay_ms: u64,
    /// Empty means any operational error is retryable.
    pub retryable_error_codes: Vec<String>,
    /// Uniform jitter fraction in `[0, 1]`: delay * (1 ± jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            retryable_error_codes: Vec::new(),
            jitter_fraction: 0.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Deadline for one step attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub timeout_ms: u64,
    /// When set, a timed-out attempt succeeds with this value instead of
    /// failing with a `timeout` error.
    pub fallback: Option<Value>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            fallback: None,
        }
    }
}

impl TimeoutPolicy {
    #[must_use]
    pub fn after_ms(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Output caching for a step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Explicit cache key; when absent the key is derived from the step's
    /// qualified id plus a hash of its resolved input.
    pub key: Option<String>,
    pub ttl_ms: Option<u64>,
    /// Escape hatch: leave the policy in place but skip the cache entirely.
    pub bypass: bool,
}

impl CachePolicy {
    #[must_use]
    pub fn derived() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// One quality criterion an evaluator judges an output against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Criterion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
        }
    }
}

/// What to do when a step's output scores below the minimum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnScoreFailure {
    /// Re-execute the step, subject to `retry_limit` and the improvement rule.
    Retry,
    /// Keep the failing output and move on.
    #[default]
    Continue,
    /// Fail the step terminally.
    Abort,
}

/// What to do when `on_failure = retry` but no further retry is permitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnScoreExhausted {
    #[default]
    Continue,
    Abort,
}

/// Output-quality gating for a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub criteria: Vec<Criterion>,
    /// Pass threshold: `passed = score >= minimum`.
    pub minimum: f64,
    pub on_failure: OnScoreFailure,
    pub on_exhausted: OnScoreExhausted,
    /// Quality-retry budget, independent of the step's `RetryPolicy`.
    pub retry_limit: u32,
    /// When true, a further quality retry is only allowed if the latest
    /// failing score improved on the previous attempt by `min_improvement`.
    pub require_improvement: bool,
    pub min_improvement: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            minimum: 0.7,
            on_failure: OnScoreFailure::Continue,
            on_exhausted: OnScoreExhausted::Continue,
            retry_limit: 2,
            require_improvement: false,
            min_improvement: 0.0,
        }
    }
}

/// One declared write into workflow-scoped mutable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateWrite {
    pub key: String,
    /// Expression resolved with the fresh output bound as `output`;
    /// absent means the whole output is written.
    #[serde(default)]
    pub value: Option<String>,
}

impl StateWrite {
    pub fn output_to(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn expr(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Declared access a step has to workflow-scoped mutable state. Writes are
/// restricted to the listed keys and applied atomically by the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateAccessConfig {
    pub set: Vec<StateWrite>,
}
