//! Aggregate quality metrics derived from a run's scoring history.

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::{ScoreHistoryEntry, ScoringState};

/// Entries per window when judging the score trend.
const TREND_WINDOW: usize = 5;
/// Mean delta below which the trend counts as stable.
const TREND_THRESHOLD: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// Rollup over a run's score history.
#[derive(Clone, Debug, Serialize)]
pub struct QualityMetrics {
    /// Weight-free ensemble: per step, the latest passing score (or the
    /// latest score if none passed), averaged across steps.
    pub ensemble_score: f64,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    /// Fraction of evaluations that met their threshold.
    pub pass_rate: f64,
    /// Per-criterion fraction of evaluations meeting the entry's threshold.
    pub criterion_pass_rate: FxHashMap<String, f64>,
    pub total_evaluations: usize,
    pub total_retries: u32,
    pub trend: Trend,
}

impl QualityMetrics {
    #[must_use]
    pub fn from_state(state: &ScoringState) -> Self {
        let history = &state.history;
        if history.is_empty() {
            return Self {
                ensemble_score: 0.0,
                average_score: 0.0,
                min_score: 0.0,
                max_score: 0.0,
                pass_rate: 0.0,
                criterion_pass_rate: FxHashMap::default(),
                total_evaluations: 0,
                total_retries: state.retry_count_by_step.values().sum(),
                trend: Trend::Stable,
            };
        }

        let scores: Vec<f64> = history.iter().map(|e| e.score).collect();
        let average_score = mean(&scores);
        let min_score = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let passed = history.iter().filter(|e| e.passed).count();
        let pass_rate = passed as f64 / history.len() as f64;

        let mut criterion_hits: FxHashMap<String, (usize, usize)> = FxHashMap::default();
        for entry in history {
            for (name, score) in &entry.breakdown {
                let slot = criterion_hits.entry(name.clone()).or_insert((0, 0));
                slot.1 += 1;
                if *score >= entry.threshold {
                    slot.0 += 1;
                }
            }
        }
        let criterion_pass_rate = criterion_hits
            .into_iter()
            .map(|(name, (hits, total))| (name, hits as f64 / total as f64))
            .collect();

        Self {
            ensemble_score: ensemble(history),
            average_score,
            min_score,
            max_score,
            pass_rate,
            criterion_pass_rate,
            total_evaluations: history.len(),
            total_retries: state.retry_count_by_step.values().sum(),
            trend: trend(&scores),
        }
    }
}

/// Representative score per step: latest passing entry, else latest entry.
fn representative_by_step(history: &[ScoreHistoryEntry]) -> FxHashMap<&str, f64> {
    let mut chosen: FxHashMap<&str, (bool, f64)> = FxHashMap::default();
    for entry in history {
        let slot = chosen
            .entry(entry.step_id.as_str())
            .or_insert((entry.passed, entry.score));
        // History is chronological; later entries override unless that would
        // replace a pass with a fail.
        if entry.passed || !slot.0 {
            *slot = (entry.passed, entry.score);
        }
    }
    chosen.into_iter().map(|(k, (_, s))| (k, s)).collect()
}

fn ensemble(history: &[ScoreHistoryEntry]) -> f64 {
    let reps = representative_by_step(history);
    if reps.is_empty() {
        return 0.0;
    }
    reps.values().sum::<f64>() / reps.len() as f64
}

/// Weighted ensemble over a run: each step's representative score, weighted
/// by the caller-supplied weight (default 1.0 for unlisted steps).
#[must_use]
pub fn weighted_ensemble(state: &ScoringState, weights: &FxHashMap<String, f64>) -> f64 {
    let reps = representative_by_step(&state.history);
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (step, score) in &reps {
        let w = weights.get(*step).copied().unwrap_or(1.0);
        total += score * w;
        weight_sum += w;
    }
    if weight_sum == 0.0 {
        0.0
    } else {
        total / weight_sum
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn trend(scores: &[f64]) -> Trend {
    let recent_start = scores.len().saturating_sub(TREND_WINDOW);
    let recent = &scores[recent_start..];
    let prior = &scores[recent_start.saturating_sub(TREND_WINDOW)..recent_start];
    if prior.is_empty() {
        return Trend::Stable;
    }
    let delta = mean(recent) - mean(prior);
    if delta > TREND_THRESHOLD {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}
