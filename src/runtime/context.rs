//! Live run context: scope paths, shared mutable run state, and snapshotting.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use tokio::sync::Mutex;

use crate::context::ContextSnapshot;
use crate::graphs::policies::StateWrite;
use crate::scoring::ScoringState;
use crate::state::{ExecutionState, RunStatus};

/// Slash-joined path of enclosing composite nodes, e.g. `outer/try1/body`.
/// Qualifying a node id with its scope path yields the id used in the
/// durable completed set and output map, which is what makes resume replay
/// deterministic across nested and iterated scopes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScopePath(String);

impl ScopePath {
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn from_qualified(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully-qualified id of a node in this scope.
    #[must_use]
    pub fn qualify(&self, id: &str) -> String {
        if self.0.is_empty() {
            id.to_string()
        } else {
            format!("{}/{id}", self.0)
        }
    }

    /// Child scope rooted at a node (or synthetic segment) in this scope.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self(self.qualify(segment))
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Mutable run state shared by all in-flight nodes, guarded by one async
/// mutex. Writers hold the lock only for map operations.
#[derive(Debug, Default)]
pub struct RunShared {
    pub state: FxHashMap<String, Value>,
    /// Outputs by qualified node id.
    pub outputs: FxHashMap<String, Value>,
    pub completed: rustc_hash::FxHashSet<String>,
    /// Failures caught by `try` nodes, keyed by the try node's qualified id.
    pub caught_errors: FxHashMap<String, Value>,
    pub scoring: ScoringState,
    /// Locals (item/index/items/error) keyed by the scope they are visible
    /// in; inner scopes inherit and shadow outer ones.
    pub scope_locals: FxHashMap<String, FxHashMap<String, Value>>,
}

/// Everything a run needs while executing: the immutable base record plus
/// the lock-guarded shared maps.
#[derive(Debug)]
pub struct RunCtx {
    pub base: ExecutionState,
    pub metadata: FxHashMap<String, Value>,
    pub shared: Mutex<RunShared>,
}

impl RunCtx {
    #[must_use]
    pub fn new(base: ExecutionState, metadata: FxHashMap<String, Value>) -> Self {
        let shared = RunShared {
            state: base.state.clone(),
            outputs: base.outputs.clone(),
            completed: base.completed.clone(),
            caught_errors: base.caught_errors.clone(),
            scoring: base.scoring.clone(),
            scope_locals: FxHashMap::default(),
        };
        Self {
            base,
            metadata,
            shared: Mutex::new(shared),
        }
    }

    /// Snapshot the context as seen from `scope`.
    ///
    /// The `steps` view exposes outputs by plain id for the scope chain from
    /// root down to `scope`, with inner entries shadowing outer ones. Locals
    /// merge the same way.
    pub async fn snapshot(&self, scope: &ScopePath) -> ContextSnapshot {
        let shared = self.shared.lock().await;
        let mut steps: FxHashMap<String, Value> = FxHashMap::default();
        let mut depth: FxHashMap<String, usize> = FxHashMap::default();
        for (qid, value) in &shared.outputs {
            let (prefix, id) = match qid.rsplit_once('/') {
                Some((prefix, id)) => (prefix, id),
                None => ("", qid.as_str()),
            };
            if !is_visible_from(prefix, scope.as_str()) {
                continue;
            }
            let d = prefix.len();
            if depth.get(id).is_none_or(|&prev| d >= prev) {
                steps.insert(id.to_string(), value.clone());
                depth.insert(id.to_string(), d);
            }
        }

        let mut local_scopes: Vec<&String> = shared
            .scope_locals
            .keys()
            .filter(|key| is_visible_from(key, scope.as_str()))
            .collect();
        local_scopes.sort_by_key(|key| key.len());
        let mut locals = FxHashMap::default();
        for key in local_scopes {
            if let Some(map) = shared.scope_locals.get(key) {
                locals.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        ContextSnapshot {
            input: self.base.input.clone(),
            state: shared.state.clone(),
            steps,
            locals,
            metadata: self.metadata.clone(),
        }
    }

    pub async fn completed_output(&self, qualified_id: &str) -> Option<Value> {
        let shared = self.shared.lock().await;
        if shared.completed.contains(qualified_id) {
            Some(
                shared
                    .outputs
                    .get(qualified_id)
                    .cloned()
                    .unwrap_or(Value::Null),
            )
        } else {
            None
        }
    }

    /// Record a completed node output.
    pub async fn record(&self, qualified_id: &str, value: Value) {
        let mut shared = self.shared.lock().await;
        shared.outputs.insert(qualified_id.to_string(), value);
        shared.completed.insert(qualified_id.to_string());
    }

    /// Failure previously caught by the try node at `qualified_id`, if any.
    pub async fn caught_error(&self, qualified_id: &str) -> Option<Value> {
        self.shared
            .lock()
            .await
            .caught_errors
            .get(qualified_id)
            .cloned()
    }

    /// Record a caught failure so a later resume replays the catch path.
    pub async fn record_caught(&self, qualified_id: &str, error: Value) {
        let mut shared = self.shared.lock().await;
        shared
            .caught_errors
            .insert(qualified_id.to_string(), error);
    }

    pub async fn set_scope_locals(&self, scope: &ScopePath, locals: FxHashMap<String, Value>) {
        let mut shared = self.shared.lock().await;
        shared.scope_locals.insert(scope.as_str().to_string(), locals);
    }

    /// Apply a step's declared state writes atomically.
    pub async fn apply_state_writes(&self, writes: Vec<(String, Value)>) {
        let mut shared = self.shared.lock().await;
        for (key, value) in writes {
            shared.state.insert(key, value);
        }
    }

    /// Materialize a durable snapshot of the run in the given status.
    pub async fn snapshot_state(&self, status: RunStatus) -> ExecutionState {
        let shared = self.shared.lock().await;
        let mut state = self.base.clone();
        state.status = status;
        state.state = shared.state.clone();
        state.outputs = shared.outputs.clone();
        state.completed = shared.completed.clone();
        state.caught_errors = shared.caught_errors.clone();
        state.scoring = shared.scoring.clone();
        state.suspension = None;
        state.error = None;
        state.touch();
        state
    }
}

/// A value bound at `owner` scope is visible from `viewer` when the owner is
/// the viewer itself or one of its ancestors.
fn is_visible_from(owner: &str, viewer: &str) -> bool {
    owner.is_empty() || viewer == owner || viewer.starts_with(&format!("{owner}/"))
}

/// Resolve a step's declared state writes against its fresh output. The
/// caller resolves any value expressions first; a `None` value means the
/// whole output.
#[must_use]
pub fn plan_state_writes(writes: &[StateWrite], resolved: Vec<Option<Value>>, output: &Value) -> Vec<(String, Value)> {
    writes
        .iter()
        .zip(resolved)
        .map(|(write, value)| {
            (
                write.key.clone(),
                value.unwrap_or_else(|| output.clone()),
            )
        })
        .collect()
}
