//! Durable run state.
//!
//! [`ExecutionState`] is the single serializable record of everything a run
//! has done: completed node ids, recorded outputs, workflow state, scoring
//! history, and (when suspended) the pending [`Suspension`]. Resume works by
//! replaying the graph against this record and skipping completed nodes, so
//! the whole suspend/resume story is "persist this struct, load it back".

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graphs::node::StepNode;
use crate::scoring::ScoringState;

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a run suspended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionReason {
    /// Human-in-the-loop approval or data entry.
    #[default]
    Hitl,
    /// Timed pause with a relative duration.
    Sleep,
    /// Timed pause until an absolute instant.
    Schedule,
    /// Waiting on an external callback.
    Webhook,
}

/// What happens when a suspension's deadline passes before anyone resumes it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OnSuspendTimeout {
    /// The run fails with a suspension-timeout error.
    #[default]
    Fail,
    /// The suspended node completes with `fallback` and the run continues.
    ContinueWithFallback {
        #[serde(default)]
        fallback: Value,
    },
}

/// A pending suspension attached to a suspended run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    /// Qualified id of the suspended node.
    pub node_id: String,
    pub reason: SuspensionReason,
    /// Opaque token the resuming party must present.
    pub resume_token: String,
    pub deadline: Option<DateTime<Utc>>,
    pub on_timeout: OnSuspendTimeout,
}

/// The full durable record of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    /// Workflow name, for operator-facing listings.
    pub workflow: String,
    pub status: RunStatus,
    pub input: Value,
    /// Qualified ids of nodes that finished; resume skips these.
    pub completed: FxHashSet<String>,
    /// Outputs by qualified node id.
    pub outputs: FxHashMap<String, Value>,
    /// Workflow-scoped mutable state.
    pub state: FxHashMap<String, Value>,
    pub suspension: Option<Suspension>,
    /// Failures caught by `try` nodes, keyed by the try node's qualified id.
    /// A resume that lands inside a catch scope replays the catch path from
    /// this record instead of re-invoking the failed body steps.
    #[serde(default)]
    pub caught_errors: FxHashMap<String, Value>,
    #[serde(default)]
    pub scoring: ScoringState,
    /// Materialized node list for generator-built workflows, so resume does
    /// not depend on the generator producing the same graph twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_nodes: Option<Vec<StepNode>>,
    pub output: Option<Value>,
    /// Structured error recorded when the run fails.
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    #[must_use]
    pub fn new(run_id: impl Into<String>, workflow: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            status: RunStatus::Pending,
            input,
            completed: FxHashSet::default(),
            outputs: FxHashMap::default(),
            state: FxHashMap::default(),
            suspension: None,
            caught_errors: FxHashMap::default(),
            scoring: ScoringState::default(),
            generated_nodes: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Compact result handed back to callers of `run`/`resume`.
#[derive(Clone, Debug, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Option<Value>,
    pub suspension: Option<Suspension>,
}

impl From<&ExecutionState> for RunHandle {
    fn from(state: &ExecutionState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            output: state.output.clone(),
            suspension: state.suspension.clone(),
        }
    }
}
