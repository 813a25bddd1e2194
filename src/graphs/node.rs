//! Workflow node definitions.
//!
//! A workflow is a flat list of [`StepNode`]s per scope; composite node kinds
//! (`parallel`, `branch`, `foreach`, ...) carry nested child scopes. The whole
//! tree serializes with a `kind` discriminator so graphs round-trip as plain
//! JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::policies::{CachePolicy, RetryPolicy, ScoringPolicy, StateAccessConfig, TimeoutPolicy};
use crate::state::{OnSuspendTimeout, SuspensionReason};

/// Opaque expression string, resolved through the configured
/// [`ExpressionResolver`](crate::resolver::ExpressionResolver).
pub type Expr = String;

/// One node in a workflow scope: an id, its in-scope dependencies, and the
/// kind-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique within the enclosing scope.
    pub id: String,
    /// Ids of sibling nodes that must complete before this node dispatches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub spec: NodeSpec,
}

impl StepNode {
    pub fn new(id: impl Into<String>, spec: NodeSpec) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            spec,
        }
    }

    /// Shorthand for a leaf step with no policies.
    pub fn step(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeSpec::Step(StepSpec {
                handler: handler.into(),
                ..StepSpec::default()
            }),
        )
    }

    #[must_use]
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Kind-specific node payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSpec {
    /// Leaf unit of work, delegated to a registered handler.
    Step(StepSpec),
    /// Run children concurrently within a child scope.
    Parallel {
        children: Vec<StepNode>,
        #[serde(default)]
        wait_for: WaitFor,
    },
    /// Two-way conditional.
    Branch {
        condition: Expr,
        then: Vec<StepNode>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<StepNode>,
    },
    /// Multi-way dispatch on a resolved value.
    Switch {
        value: Expr,
        cases: Vec<SwitchCase>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        default: Vec<StepNode>,
    },
    /// Run the body once per element of a resolved array.
    Foreach {
        items: Expr,
        body: Vec<StepNode>,
        /// Concurrent-iteration window; unset falls back to the executor's
        /// `max_concurrency`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        /// Evaluated after each completed iteration with `item`, `index`,
        /// and `output` bound; truthy stops dispatching further iterations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        break_when: Option<Expr>,
    },
    /// Structured error handling around a body scope.
    Try {
        body: Vec<StepNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch: Option<Vec<StepNode>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finally: Option<Vec<StepNode>>,
    },
    /// Do-while loop: the body always runs at least once.
    While {
        condition: Expr,
        body: Vec<StepNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Fan out a map node per item, then run a single reduce node with the
    /// collected outputs bound as `items`.
    MapReduce {
        items: Expr,
        map: Box<StepNode>,
        reduce: Box<StepNode>,
        /// Concurrent-map window; unset falls back to the executor's
        /// `max_concurrency`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Park the run durably until an external party resumes it.
    Suspend {
        #[serde(default)]
        reason: SuspensionReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        on_timeout: OnSuspendTimeout,
    },
    /// Timed suspension: resumes automatically when the deadline expires.
    Sleep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
}

impl NodeSpec {
    /// Stable kind label used in events and logs.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Step(_) => "step",
            Self::Parallel { .. } => "parallel",
            Self::Branch { .. } => "branch",
            Self::Switch { .. } => "switch",
            Self::Foreach { .. } => "foreach",
            Self::Try { .. } => "try",
            Self::While { .. } => "while",
            Self::MapReduce { .. } => "map_reduce",
            Self::Suspend { .. } => "suspend",
            Self::Sleep { .. } => "sleep",
        }
    }
}

/// Leaf step configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registry name of the implementation to invoke.
    pub handler: String,
    /// Input expression; absent means the scope's default input (workflow
    /// input, or `item` inside a foreach body, or `items` for a reduce step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_access: Option<StateAccessConfig>,
}

/// Completion rule for a `parallel` node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitFor {
    /// All children must succeed.
    #[default]
    All,
    /// First child to succeed wins; later failures are discarded.
    Any,
    /// First child to finish wins, success or failure.
    First,
}

/// One arm of a `switch` node, matched by structural equality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub when: Value,
    pub body: Vec<StepNode>,
}
