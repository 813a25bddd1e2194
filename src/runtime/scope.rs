//! Scope execution loop.
//!
//! A scope is a flat list of nodes with in-scope dependencies. The loop keeps
//! a ready set (dependencies satisfied, not yet dispatched) and drives up to
//! `max_concurrency` node futures at once through a [`FuturesUnordered`].
//! Futures run cooperatively on the caller's task, so dropping the set
//! cancels every in-flight sibling.

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::warn;

use super::GraphExecutor;
use super::context::{RunCtx, ScopePath};
use crate::errors::ExecutorError;
use crate::graphs::node::StepNode;
use crate::state::{RunStatus, Suspension};

/// How a whole scope finished.
#[derive(Debug)]
pub(crate) enum ScopeOutcome {
    Completed,
    Suspended(Suspension),
}

/// How a single node finished.
#[derive(Debug)]
pub(crate) enum NodeOutcome {
    Value(Value),
    Suspended(Suspension),
}

/// How a nested block (child scope plus output projection) finished.
#[derive(Debug)]
pub(crate) enum BlockOutcome {
    Done(Value),
    Suspended(Suspension),
}

impl GraphExecutor {
    /// Drive every node in `nodes` to completion within `scope`.
    ///
    /// Nodes already present in the durable completed set are skipped, which
    /// is what makes resume a plain re-execution. On suspension the first
    /// suspension wins; already-dispatched siblings are drained so their
    /// outputs land in the durable record before the run parks.
    pub(crate) fn run_scope<'a>(
        &'a self,
        ctx: &'a RunCtx,
        nodes: &'a [StepNode],
        scope: ScopePath,
    ) -> futures_util::future::BoxFuture<'a, Result<ScopeOutcome, ExecutorError>> {
        Box::pin(async move {
            let mut done: FxHashSet<&str> = FxHashSet::default();
            {
                let shared = ctx.shared.lock().await;
                for node in nodes {
                    if shared.completed.contains(&scope.qualify(&node.id)) {
                        done.insert(node.id.as_str());
                    }
                }
            }
            let mut dispatched: FxHashSet<&str> = done.clone();
            let mut pending_suspension: Option<Suspension> = None;
            let mut in_flight = FuturesUnordered::new();

            loop {
                if pending_suspension.is_none() {
                    for node in nodes {
                        if in_flight.len() >= self.config.max_concurrency {
                            break;
                        }
                        if dispatched.contains(node.id.as_str()) {
                            continue;
                        }
                        if !node.depends_on.iter().all(|d| done.contains(d.as_str())) {
                            continue;
                        }
                        dispatched.insert(node.id.as_str());
                        let scope = scope.clone();
                        in_flight.push(Box::pin(async move {
                            (node, self.execute_node(ctx, node, scope).await)
                        }));
                    }
                }

                if in_flight.is_empty() {
                    if let Some(susp) = pending_suspension {
                        return Ok(ScopeOutcome::Suspended(susp));
                    }
                    if done.len() == nodes.len() {
                        return Ok(ScopeOutcome::Completed);
                    }
                    let stuck: Vec<String> = nodes
                        .iter()
                        .filter(|n| !done.contains(n.id.as_str()))
                        .map(|n| scope.qualify(&n.id))
                        .collect();
                    return Err(ExecutorError::Deadlock { nodes: stuck });
                }

                // Drop of `in_flight` on error cancels every sibling.
                let Some((node, outcome)) = in_flight.next().await else {
                    continue;
                };
                match outcome? {
                    NodeOutcome::Value(value) => {
                        ctx.record(&scope.qualify(&node.id), value).await;
                        done.insert(node.id.as_str());
                        if self.config.autosave_each_node {
                            self.autosave(ctx).await;
                        }
                    }
                    NodeOutcome::Suspended(susp) => {
                        if pending_suspension.is_none() {
                            pending_suspension = Some(susp);
                        }
                    }
                }
            }
        })
    }

    /// Best-effort mid-run save; a failing store must not kill a healthy run.
    async fn autosave(&self, ctx: &RunCtx) {
        let snapshot = ctx.snapshot_state(RunStatus::Running).await;
        if let Err(err) = self.store.save(&snapshot).await {
            warn!(run_id = %snapshot.run_id, %err, "autosave failed");
        }
    }
}
