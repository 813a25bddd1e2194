//! Output scoring and quality gating.
//!
//! Steps with a [`ScoringPolicy`] have every successful output judged by a
//! pluggable [`Evaluator`]. The [`ScoringEngine`] turns an evaluation into a
//! [`ScoreDecision`] (accept, quality-retry, continue, abort) and appends to
//! the run's durable [`ScoringState`]. Quality retries have their own budget,
//! separate from the failure-retry budget on the step's `RetryPolicy`.

pub mod metrics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::graphs::policies::{Criterion, OnScoreExhausted, OnScoreFailure, ScoringPolicy};
use crate::step::StepError;

pub use metrics::{QualityMetrics, Trend, weighted_ensemble};

/// Result of evaluating one output against a set of criteria.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Aggregate score in `[0, 1]` (clamped by the engine).
    pub score: f64,
    /// Per-criterion scores, keyed by criterion name.
    #[serde(default)]
    pub breakdown: FxHashMap<String, f64>,
}

impl Evaluation {
    #[must_use]
    pub fn of(score: f64) -> Self {
        Self {
            score,
            breakdown: FxHashMap::default(),
        }
    }
}

/// Judges a step output against criteria. Typically an LLM rubric call or a
/// deterministic checker; the engine treats it as an opaque async oracle.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn score(&self, output: &Value, criteria: &[Criterion]) -> Result<Evaluation, StepError>;
}

/// One recorded evaluation, durable with the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreHistoryEntry {
    /// Qualified id of the scored step.
    pub step_id: String,
    pub attempt: u32,
    pub score: f64,
    pub breakdown: FxHashMap<String, f64>,
    pub passed: bool,
    /// Threshold in force when this entry was recorded.
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Durable scoring record accumulated across a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringState {
    pub history: Vec<ScoreHistoryEntry>,
    /// Quality retries consumed per qualified step id.
    pub retry_count_by_step: FxHashMap<String, u32>,
    /// Weighted ensemble over the run, set on completion.
    pub final_score: Option<f64>,
}

impl ScoringState {
    /// Most recent entry for a step, across attempts.
    #[must_use]
    pub fn latest_for(&self, step_id: &str) -> Option<&ScoreHistoryEntry> {
        self.history.iter().rev().find(|e| e.step_id == step_id)
    }

    #[must_use]
    pub fn metrics(&self) -> QualityMetrics {
        QualityMetrics::from_state(self)
    }
}

/// What the executor does with a scored attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreDecision {
    /// Score met the minimum; keep the output.
    Accept,
    /// Below minimum; re-execute the step.
    Retry,
    /// Below minimum but policy says keep it and move on.
    Continue,
    /// Below minimum and policy says fail the step.
    Abort,
}

/// Applies scoring policy to evaluations and maintains [`ScoringState`].
#[derive(Clone)]
pub struct ScoringEngine {
    evaluator: Arc<dyn Evaluator>,
}

impl std::fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScoringEngine(..)")
    }
}

impl ScoringEngine {
    pub fn new(evaluator: impl Evaluator + 'static) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
        }
    }

    #[must_use]
    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        Arc::clone(&self.evaluator)
    }

    /// Record an evaluation and decide what to do with the attempt.
    ///
    /// Synchronous so the runtime can call it under its state lock; the
    /// (potentially slow) evaluator runs outside the lock.
    pub fn apply(
        &self,
        step_id: &str,
        attempt: u32,
        evaluation: Evaluation,
        policy: &ScoringPolicy,
        state: &mut ScoringState,
    ) -> (ScoreHistoryEntry, ScoreDecision) {
        let score = evaluation.score.clamp(0.0, 1.0);
        let passed = score >= policy.minimum;
        let previous = state.latest_for(step_id).map(|e| e.score);
        let entry = ScoreHistoryEntry {
            step_id: step_id.to_string(),
            attempt,
            score,
            breakdown: evaluation.breakdown,
            passed,
            threshold: policy.minimum,
            timestamp: Utc::now(),
        };
        state.history.push(entry.clone());

        if passed {
            return (entry, ScoreDecision::Accept);
        }
        let decision = match policy.on_failure {
            OnScoreFailure::Continue => ScoreDecision::Continue,
            OnScoreFailure::Abort => ScoreDecision::Abort,
            OnScoreFailure::Retry => {
                let used = state
                    .retry_count_by_step
                    .get(step_id)
                    .copied()
                    .unwrap_or(0);
                let improving = !policy.require_improvement
                    || previous.is_none_or(|prev| score - prev >= policy.min_improvement);
                if used < policy.retry_limit && improving {
                    *state.retry_count_by_step.entry(step_id.to_string()).or_insert(0) += 1;
                    ScoreDecision::Retry
                } else {
                    match policy.on_exhausted {
                        OnScoreExhausted::Continue => ScoreDecision::Continue,
                        OnScoreExhausted::Abort => ScoreDecision::Abort,
                    }
                }
            }
        };
        (entry, decision)
    }

    /// Evaluate and apply in one call; convenience for hosts scoring outside
    /// the executor.
    pub async fn evaluate(
        &self,
        step_id: &str,
        attempt: u32,
        output: &Value,
        policy: &ScoringPolicy,
        state: &mut ScoringState,
    ) -> Result<(ScoreHistoryEntry, ScoreDecision), StepError> {
        let evaluation = self.evaluator.score(output, &policy.criteria).await?;
        Ok(self.apply(step_id, attempt, evaluation, policy, state))
    }
}
