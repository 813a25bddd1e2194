//! Read-mostly execution context handed to steps and expression resolution.
//!
//! A [`ContextSnapshot`] is taken at dispatch time (lock-free for the reader:
//! the executor clones under its own lock and hands out an owned value), so a
//! step never observes a torn multi-key state write from a concurrently
//! completing sibling.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Immutable view of a run's context at one point in time.
///
/// - `input`: the workflow's initial input payload.
/// - `state`: workflow-scoped mutable state, snapshotted at dispatch.
/// - `steps`: prior step outputs keyed by plain node id (root scope plus the
///   enclosing scope chain; inner entries shadow outer ones).
/// - `locals`: scope-bound values such as `item`/`index` inside a `foreach`,
///   `items` inside a reduce step, or `error` inside a `catch` block.
/// - `metadata`: arbitrary workflow metadata, read-only for the whole run.
#[derive(Clone, Debug, Default)]
pub struct ContextSnapshot {
    pub input: Value,
    pub state: FxHashMap<String, Value>,
    pub steps: FxHashMap<String, Value>,
    pub locals: FxHashMap<String, Value>,
    pub metadata: FxHashMap<String, Value>,
}

impl ContextSnapshot {
    /// Snapshot with only an input payload, for tests and ad-hoc resolution.
    #[must_use]
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_local(mut self, key: impl Into<String>, value: Value) -> Self {
        self.locals.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_step_output(mut self, id: impl Into<String>, value: Value) -> Self {
        self.steps.insert(id.into(), value);
        self
    }
}

/// Truthiness rule used for `condition` and `break_when` expressions.
///
/// `null`, `false`, `0`, `""`, and `[]` are false; everything else is true.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_none_or(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}
