//! Workflow definitions: node types, per-step policies, and structural
//! validation.

pub mod node;
pub mod policies;
pub mod validate;

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use node::{Expr, NodeSpec, StepNode, StepSpec, SwitchCase, WaitFor};
pub use policies::{
    Backoff, CachePolicy, Criterion, OnScoreExhausted, OnScoreFailure, RetryPolicy, ScoringPolicy,
    StateAccessConfig, StateWrite, TimeoutPolicy,
};
pub use validate::{GraphError, validate};

/// Builds a node list from the run's input, for workflows whose shape depends
/// on the data (e.g. one branch per document in the payload).
///
/// The generated nodes are validated and then persisted with the run, so
/// resume never re-invokes the generator.
pub trait GraphGenerator: Send + Sync {
    fn generate(&self, input: &Value) -> Result<Vec<StepNode>, GraphError>;
}

/// Node source for a workflow: fixed at build time or generated per run.
#[derive(Clone)]
pub enum WorkflowNodes {
    Static(Vec<StepNode>),
    Generated(Arc<dyn GraphGenerator>),
}

impl fmt::Debug for WorkflowNodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(nodes) => f.debug_tuple("Static").field(&nodes.len()).finish(),
            Self::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

/// A named, executable workflow definition.
#[derive(Clone, Debug)]
pub struct Workflow {
    pub name: String,
    pub nodes: WorkflowNodes,
    /// Expression resolved at root scope after the last node completes;
    /// absent means the final node's output (or an id-keyed object when the
    /// root scope has several terminal nodes).
    pub output: Option<Expr>,
    /// Read-only metadata exposed to expressions under `meta`.
    pub metadata: FxHashMap<String, Value>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, nodes: Vec<StepNode>) -> Self {
        Self {
            name: name.into(),
            nodes: WorkflowNodes::Static(nodes),
            output: None,
            metadata: FxHashMap::default(),
        }
    }

    pub fn generated(name: impl Into<String>, generator: impl GraphGenerator + 'static) -> Self {
        Self {
            name: name.into(),
            nodes: WorkflowNodes::Generated(Arc::new(generator)),
            output: None,
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_output(mut self, expr: impl Into<Expr>) -> Self {
        self.output = Some(expr.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
