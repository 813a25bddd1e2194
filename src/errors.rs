//! Executor error taxonomy.
//!
//! Every failure surfaced by the runtime is an [`ExecutorError`]. Each variant
//! carries a stable `code()` used in the durable run record and in events, and
//! a subset of variants is "catchable" by a `try` node's catch block.

use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;

use crate::graphs::GraphError;
use crate::resolver::ResolveError;
use crate::state::RunStatus;
use crate::step::StepError;
use crate::store::StoreError;

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("step `{step_id}` references unknown handler `{handler}`")]
    #[diagnostic(
        code(weftflow::runtime::step_not_found),
        help("register the handler with the executor's step registry")
    )]
    StepNotFound { step_id: String, handler: String },

    #[error("invalid configuration on step `{step_id}`: {reason}")]
    #[diagnostic(code(weftflow::runtime::invalid_step_config))]
    InvalidStepConfig { step_id: String, reason: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    ValidationFailed(#[from] GraphError),

    #[error("step `{step_id}` failed after {attempts} attempt(s)")]
    #[diagnostic(code(weftflow::runtime::step_failed))]
    StepExecutionFailed {
        step_id: String,
        attempts: u32,
        #[source]
        source: StepError,
    },

    #[error("step `{step_id}` timed out after {timeout_ms}ms")]
    #[diagnostic(code(weftflow::runtime::timeout))]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("loop `{node_id}` exceeded {max} iteration(s)")]
    #[diagnostic(code(weftflow::runtime::max_iterations))]
    MaxIterationsExceeded { node_id: String, max: u32 },

    #[error("no dispatchable node; stuck on: {}", .nodes.join(", "))]
    #[diagnostic(
        code(weftflow::runtime::deadlock),
        help("check depends_on for cycles among the listed nodes")
    )]
    Deadlock { nodes: Vec<String> },

    #[error("run `{run_id}` suspension at `{node_id}` expired")]
    #[diagnostic(code(weftflow::runtime::suspension_timeout))]
    SuspensionTimeout { run_id: String, node_id: String },

    #[error("invalid resume token for run `{run_id}`")]
    #[diagnostic(code(weftflow::runtime::invalid_resume_token))]
    InvalidResumeToken { run_id: String },

    #[error("run `{run_id}` is not suspended (status: {status:?})")]
    #[diagnostic(code(weftflow::runtime::not_suspended))]
    NotSuspended { run_id: String, status: RunStatus },

    #[error("failed to resolve `{expr}`")]
    #[diagnostic(code(weftflow::runtime::resolve))]
    Resolve {
        expr: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    #[diagnostic(code(weftflow::runtime::internal))]
    Internal(String),
}

impl ExecutorError {
    /// Stable code recorded in the durable run record and in `RunFailed`
    /// events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StepNotFound { .. } => "step_not_found",
            Self::InvalidStepConfig { .. } => "invalid_step_config",
            Self::ValidationFailed(_) => "validation_failed",
            Self::StepExecutionFailed { .. } => "step_failed",
            Self::Timeout { .. } => "timeout",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            Self::Deadlock { .. } => "deadlock",
            Self::SuspensionTimeout { .. } => "suspension_timeout",
            Self::InvalidResumeToken { .. } => "invalid_resume_token",
            Self::NotSuspended { .. } => "not_suspended",
            Self::Resolve { .. } => "resolve_failed",
            Self::Store(_) => "store_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a `try` node's catch block intercepts this error. Definition
    /// and infrastructure errors always propagate.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            Self::StepExecutionFailed { .. }
                | Self::Timeout { .. }
                | Self::MaxIterationsExceeded { .. }
                | Self::SuspensionTimeout { .. }
        )
    }

    /// JSON shape bound as `error` in catch scopes and stored on failed runs.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::StepExecutionFailed {
                step_id,
                attempts,
                source,
            } => json!({
                "code": self.code(),
                "message": self.to_string(),
                "details": {
                    "step_id": step_id,
                    "attempts": attempts,
                    "cause": source.to_value(),
                },
            }),
            other => json!({
                "code": other.code(),
                "message": other.to_string(),
                "details": Value::Null,
            }),
        }
    }
}
