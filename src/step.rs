//! Step implementation seam: the contract between the executor and the
//! external code that does the actual work of a leaf step.
//!
//! The executor never inspects what a step does internally. It resolves the
//! step's input, invokes the registered [`StepHandler`], and interprets the
//! structured success/failure result. Failures carry a stable `code` and an
//! [`ErrorClass`] so the retry controller can distinguish transient
//! operational errors from programming bugs.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

use crate::context::ContextSnapshot;
use crate::events::EventEmitter;

/// Classifies a step failure for retry purposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient or environmental failure; retryable per policy.
    #[default]
    Operational,
    /// Programming-bug class failure; never retried.
    Bug,
}

/// Structured failure produced by a step implementation (or an evaluator).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Stable machine-readable code, matched against
    /// `RetryPolicy::retryable_error_codes`.
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub class: ErrorClass,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Value::Null,
            class: ErrorClass::Operational,
        }
    }

    /// A non-operational failure that must never be retried.
    pub fn bug(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Bug,
            ..Self::new(code, message)
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// JSON shape bound into context as `error` inside `catch` blocks.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "details": self.details,
        })
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StepError {}

/// Per-attempt execution context passed to a step implementation.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub run_id: String,
    /// Qualified node path, e.g. `try1/body/fetch`.
    pub step_id: String,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Read-only view of the run at dispatch time.
    pub snapshot: ContextSnapshot,
    /// Emitter for host-visible progress events.
    pub emitter: EventEmitter,
}

/// One unit of external work.
///
/// Implementations must support cancellation by drop: a timed-out attempt is
/// cancelled by dropping its future.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn invoke(&self, input: Value, ctx: StepContext) -> Result<Value, StepError>;
}

/// Lookup of step handlers by the `handler` name a [`StepSpec`] references.
///
/// [`StepSpec`]: crate::graphs::node::StepSpec
pub trait StepRegistry: Send + Sync {
    fn get(&self, handler: &str) -> Option<Arc<dyn StepHandler>>;
}

/// Map-backed reference registry.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    handlers: FxHashMap<String, Arc<dyn StepHandler>>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn register(
        mut self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn register_arc(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StepRegistry for InMemoryRegistry {
    fn get(&self, handler: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(handler).cloned()
    }
}
