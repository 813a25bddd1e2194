//! Step handlers and evaluators for tests and examples.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::graphs::policies::Criterion;
use crate::scoring::{Evaluation, Evaluator};
use crate::step::{ErrorClass, StepContext, StepError, StepHandler};

/// Wrap a plain closure as a step handler.
pub struct FnStep<F>(F);

#[async_trait]
impl<F> StepHandler for FnStep<F>
where
    F: Fn(Value) -> Result<Value, StepError> + Send + Sync,
{
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        (self.0)(input)
    }
}

pub fn fn_step<F>(f: F) -> FnStep<F>
where
    F: Fn(Value) -> Result<Value, StepError> + Send + Sync,
{
    FnStep(f)
}

/// Returns its input unchanged.
pub struct EchoStep;

#[async_trait]
impl StepHandler for EchoStep {
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        Ok(input)
    }
}

/// Doubles a numeric input.
pub struct DoubleStep;

#[async_trait]
impl StepHandler for DoubleStep {
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        let n = input
            .as_f64()
            .ok_or_else(|| StepError::new("bad_input", format!("not a number: {input}")))?;
        Ok(json!(n * 2.0))
    }
}

/// Sums a numeric array input.
pub struct SumStep;

#[async_trait]
impl StepHandler for SumStep {
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        let items = input
            .as_array()
            .ok_or_else(|| StepError::new("bad_input", format!("not an array: {input}")))?;
        let mut total = 0.0;
        for item in items {
            total += item
                .as_f64()
                .ok_or_else(|| StepError::new("bad_input", format!("not a number: {item}")))?;
        }
        Ok(json!(total))
    }
}

/// Fails the first `fail_times` invocations, then echoes its input.
pub struct FlakyStep {
    fail_times: u32,
    code: String,
    calls: AtomicU32,
}

impl FlakyStep {
    #[must_use]
    pub fn new(fail_times: u32, code: impl Into<String>) -> Self {
        Self {
            fail_times,
            code: code.into(),
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for FlakyStep {
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Err(StepError::new(&self.code, format!("induced failure #{call}")))
        } else {
            Ok(input)
        }
    }
}

/// Always fails with a fixed code and class.
pub struct AlwaysFail {
    pub code: String,
    pub class: ErrorClass,
}

impl AlwaysFail {
    #[must_use]
    pub fn operational(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            class: ErrorClass::Operational,
        }
    }

    #[must_use]
    pub fn bug(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            class: ErrorClass::Bug,
        }
    }
}

#[async_trait]
impl StepHandler for AlwaysFail {
    async fn invoke(&self, _input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        Err(StepError {
            code: self.code.clone(),
            message: "induced failure".into(),
            details: Value::Null,
            class: self.class,
        })
    }
}

/// Sleeps, then returns a fixed output. Pair with `start_paused` tests.
pub struct SlowStep {
    pub delay_ms: u64,
    pub output: Value,
}

#[async_trait]
impl StepHandler for SlowStep {
    async fn invoke(&self, _input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        Ok(self.output.clone())
    }
}

/// Counts invocations; the shared counter outlives the registry.
pub struct CountingStep {
    calls: std::sync::Arc<AtomicU32>,
    output: Value,
}

impl CountingStep {
    #[must_use]
    pub fn new(calls: std::sync::Arc<AtomicU32>, output: Value) -> Self {
        Self { calls, output }
    }
}

#[async_trait]
impl StepHandler for CountingStep {
    async fn invoke(&self, _input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Returns a scripted sequence of scores, then 1.0 forever.
pub struct ScriptedEvaluator {
    scores: Mutex<VecDeque<f64>>,
}

impl ScriptedEvaluator {
    #[must_use]
    pub fn new(scores: impl IntoIterator<Item = f64>) -> Self {
        Self {
            scores: Mutex::new(scores.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn score(
        &self,
        _output: &Value,
        _criteria: &[Criterion],
    ) -> Result<Evaluation, StepError> {
        let score = self
            .scores
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(1.0);
        let mut evaluation = Evaluation::of(score);
        evaluation.breakdown.insert("overall".to_string(), score);
        Ok(evaluation)
    }
}
