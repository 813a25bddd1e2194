//! Per-node execution: control-flow kinds and their child scopes.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::GraphExecutor;
use super::context::{RunCtx, ScopePath};
use super::scope::{BlockOutcome, NodeOutcome, ScopeOutcome};
use crate::context::truthy;
use crate::errors::ExecutorError;
use crate::events::RunEvent;
use crate::graphs::node::{NodeSpec, StepNode, SwitchCase, WaitFor};
use crate::state::{OnSuspendTimeout, Suspension, SuspensionReason};

impl GraphExecutor {
    /// Execute one node within `scope`, recursing into child scopes for
    /// composite kinds. Already-completed nodes short-circuit to their
    /// recorded output, which is the whole resume mechanism.
    pub(crate) fn execute_node<'a>(
        &'a self,
        ctx: &'a RunCtx,
        node: &'a StepNode,
        scope: ScopePath,
    ) -> BoxFuture<'a, Result<NodeOutcome, ExecutorError>> {
        Box::pin(async move {
            let qid = scope.qualify(&node.id);
            if let Some(recorded) = ctx.completed_output(&qid).await {
                return Ok(NodeOutcome::Value(recorded));
            }

            self.emitter.emit(RunEvent::NodeStarted {
                run_id: ctx.base.run_id.clone(),
                path: qid.clone(),
                kind: node.spec.kind_name().to_string(),
            });
            debug!(path = %qid, kind = node.spec.kind_name(), "node started");

            let outcome = match &node.spec {
                NodeSpec::Step(spec) => self.execute_step(ctx, spec, &scope, &qid).await,
                NodeSpec::Parallel { children, wait_for } => {
                    self.execute_parallel(ctx, children, *wait_for, &qid).await
                }
                NodeSpec::Branch {
                    condition,
                    then,
                    otherwise,
                } => {
                    let inner = ScopePath::from_qualified(&qid);
                    let value = self.resolve_expr(ctx, &scope, condition).await?;
                    let (arm, arm_scope) = if truthy(&value) {
                        (then.as_slice(), inner.child("then"))
                    } else {
                        (otherwise.as_slice(), inner.child("else"))
                    };
                    self.run_block(ctx, arm, arm_scope)
                        .await
                        .map(BlockOutcome::into_outcome)
                }
                NodeSpec::Switch {
                    value,
                    cases,
                    default,
                } => {
                    self.execute_switch(ctx, value, cases, default, &scope, &qid)
                        .await
                }
                NodeSpec::Foreach {
                    items,
                    body,
                    max_concurrency,
                    break_when,
                } => {
                    self.execute_foreach(
                        ctx,
                        items,
                        body,
                        *max_concurrency,
                        break_when.as_deref(),
                        &scope,
                        &qid,
                    )
                    .await
                }
                NodeSpec::Try {
                    body,
                    catch,
                    finally,
                } => {
                    self.execute_try(
                        ctx,
                        body,
                        catch.as_deref(),
                        finally.as_deref(),
                        &qid,
                    )
                    .await
                }
                NodeSpec::While {
                    condition,
                    body,
                    max_iterations,
                } => {
                    self.execute_while(ctx, condition, body, *max_iterations, &qid)
                        .await
                }
                NodeSpec::MapReduce {
                    items,
                    map,
                    reduce,
                    max_concurrency,
                } => {
                    self.execute_map_reduce(ctx, items, map, reduce, *max_concurrency, &scope, &qid)
                        .await
                }
                NodeSpec::Suspend {
                    reason,
                    timeout_ms,
                    on_timeout,
                } => Ok(NodeOutcome::Suspended(Suspension {
                    node_id: qid.clone(),
                    reason: *reason,
                    resume_token: self.ids.generate_resume_token(),
                    deadline: (*timeout_ms).map(deadline_after),
                    on_timeout: on_timeout.clone(),
                })),
                NodeSpec::Sleep { duration_ms, until } => {
                    let (reason, deadline) = match (duration_ms, until) {
                        (Some(ms), _) => (SuspensionReason::Sleep, Some(deadline_after(*ms))),
                        (None, Some(at)) => (SuspensionReason::Schedule, Some(*at)),
                        // Unreachable past validation; treat as instant wake.
                        (None, None) => (SuspensionReason::Sleep, Some(Utc::now())),
                    };
                    Ok(NodeOutcome::Suspended(Suspension {
                        node_id: qid.clone(),
                        reason,
                        resume_token: self.ids.generate_resume_token(),
                        deadline,
                        // Expiry is how sleeps wake up.
                        on_timeout: OnSuspendTimeout::ContinueWithFallback {
                            fallback: Value::Null,
                        },
                    }))
                }
            }?;

            if matches!(outcome, NodeOutcome::Value(_)) {
                self.emitter.emit(RunEvent::NodeCompleted {
                    run_id: ctx.base.run_id.clone(),
                    path: qid,
                });
            }
            Ok(outcome)
        })
    }

    /// Run a child node list as a nested scope and project its block output:
    /// a single node's output directly, or an id-keyed object for several.
    pub(crate) async fn run_block(
        &self,
        ctx: &RunCtx,
        nodes: &[StepNode],
        scope: ScopePath,
    ) -> Result<BlockOutcome, ExecutorError> {
        if nodes.is_empty() {
            return Ok(BlockOutcome::Done(Value::Null));
        }
        match self.run_scope(ctx, nodes, scope.clone()).await? {
            ScopeOutcome::Suspended(susp) => Ok(BlockOutcome::Suspended(susp)),
            ScopeOutcome::Completed => {
                let shared = ctx.shared.lock().await;
                let value = if nodes.len() == 1 {
                    shared
                        .outputs
                        .get(&scope.qualify(&nodes[0].id))
                        .cloned()
                        .unwrap_or(Value::Null)
                } else {
                    let mut map = serde_json::Map::new();
                    for node in nodes {
                        map.insert(
                            node.id.clone(),
                            shared
                                .outputs
                                .get(&scope.qualify(&node.id))
                                .cloned()
                                .unwrap_or(Value::Null),
                        );
                    }
                    Value::Object(map)
                };
                Ok(BlockOutcome::Done(value))
            }
        }
    }

    async fn execute_parallel(
        &self,
        ctx: &RunCtx,
        children: &[StepNode],
        wait_for: WaitFor,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);
        if wait_for == WaitFor::All {
            return self
                .run_block(ctx, children, inner)
                .await
                .map(BlockOutcome::into_outcome);
        }

        // any/first race all children at once; depends_on is not honored in
        // racing mode since losers are cancelled anyway.
        let mut in_flight: FuturesUnordered<_> = children
            .iter()
            .map(|child| {
                let inner = inner.clone();
                async move { (child, self.execute_node(ctx, child, inner).await) }
            })
            .collect();

        let mut remaining = in_flight.len();
        while let Some((child, result)) = in_flight.next().await {
            remaining -= 1;
            match result {
                Ok(NodeOutcome::Value(value)) => {
                    // Winner; dropping the set cancels the losing siblings.
                    ctx.record(&inner.qualify(&child.id), value.clone()).await;
                    return Ok(NodeOutcome::Value(value));
                }
                Ok(NodeOutcome::Suspended(susp)) => return Ok(NodeOutcome::Suspended(susp)),
                Err(err) if wait_for == WaitFor::Any && remaining > 0 => {
                    warn!(path = %inner.qualify(&child.id), %err, "racing sibling failed");
                    self.emitter.emit(RunEvent::SiblingDiscarded {
                        run_id: ctx.base.run_id.clone(),
                        path: inner.qualify(&child.id),
                        error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        // All children suspended-free and errored out under `any`.
        Err(ExecutorError::Internal(format!(
            "parallel `{qid}` finished without a winner"
        )))
    }

    async fn execute_switch(
        &self,
        ctx: &RunCtx,
        value_expr: &str,
        cases: &[SwitchCase],
        default: &[StepNode],
        scope: &ScopePath,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);
        let value = self.resolve_expr(ctx, scope, value_expr).await?;
        for (i, case) in cases.iter().enumerate() {
            if case.when == value {
                return self
                    .run_block(ctx, &case.body, inner.child(&format!("case{i}")))
                    .await
                    .map(BlockOutcome::into_outcome);
            }
        }
        self.run_block(ctx, default, inner.child("default"))
            .await
            .map(BlockOutcome::into_outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_foreach(
        &self,
        ctx: &RunCtx,
        items_expr: &str,
        body: &[StepNode],
        max_concurrency: Option<usize>,
        break_when: Option<&str>,
        scope: &ScopePath,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);
        let items = self.resolve_items(ctx, scope, items_expr, qid).await?;
        let window = max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);

        let mut results: Vec<Option<Value>> = vec![None; items.len()];
        let mut next = 0usize;
        let mut stop_dispatch = false;
        let mut pending_suspension: Option<Suspension> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while !stop_dispatch && pending_suspension.is_none() && next < items.len() {
                if in_flight.len() >= window {
                    break;
                }
                let idx = next;
                next += 1;
                let item = items[idx].clone();
                let iter_scope = inner.child(&format!("[{idx}]"));
                in_flight.push(async move {
                    let mut locals = FxHashMap::default();
                    locals.insert("item".to_string(), item.clone());
                    locals.insert("index".to_string(), json!(idx));
                    ctx.set_scope_locals(&iter_scope, locals).await;
                    let out = self.run_block(ctx, body, iter_scope).await;
                    (idx, item, out)
                });
            }

            let Some((idx, item, outcome)) = in_flight.next().await else {
                break;
            };
            match outcome? {
                BlockOutcome::Suspended(susp) => {
                    if pending_suspension.is_none() {
                        pending_suspension = Some(susp);
                    }
                }
                BlockOutcome::Done(value) => {
                    if let Some(expr) = break_when {
                        let mut extra = FxHashMap::default();
                        extra.insert("item".to_string(), item);
                        extra.insert("index".to_string(), json!(idx));
                        extra.insert("output".to_string(), value.clone());
                        let verdict = self.resolve_with(ctx, scope, expr, extra).await?;
                        if truthy(&verdict) {
                            stop_dispatch = true;
                        }
                    }
                    results[idx] = Some(value);
                }
            }
        }

        if let Some(susp) = pending_suspension {
            return Ok(NodeOutcome::Suspended(susp));
        }
        Ok(NodeOutcome::Value(Value::Array(
            results.into_iter().flatten().collect(),
        )))
    }

    async fn execute_try(
        &self,
        ctx: &RunCtx,
        body: &[StepNode],
        catch: Option<&[StepNode]>,
        finally: Option<&[StepNode]>,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);

        // A durably recorded body failure means this is a replay that already
        // entered the catch path; the failed body steps are not re-invoked.
        let result = if let Some(error) = ctx.caught_error(qid).await {
            match self.run_catch(ctx, catch.unwrap_or_default(), &inner, error).await {
                Ok(BlockOutcome::Suspended(susp)) => return Ok(NodeOutcome::Suspended(susp)),
                Ok(BlockOutcome::Done(value)) => Ok(value),
                Err(err) => Err(err),
            }
        } else {
            match self.run_block(ctx, body, inner.child("body")).await {
                // A suspended body resumes into the try node later; finally
                // runs on that replay, after the body actually finishes.
                Ok(BlockOutcome::Suspended(susp)) => return Ok(NodeOutcome::Suspended(susp)),
                Ok(BlockOutcome::Done(value)) => Ok(value),
                Err(err) if err.is_catchable() && catch.is_some() => {
                    let error = err.to_value();
                    ctx.record_caught(qid, error.clone()).await;
                    match self.run_catch(ctx, catch.unwrap_or_default(), &inner, error).await {
                        Ok(BlockOutcome::Suspended(susp)) => return Ok(NodeOutcome::Suspended(susp)),
                        Ok(BlockOutcome::Done(value)) => Ok(value),
                        // A failing catch still goes through finally below.
                        Err(catch_err) => Err(catch_err),
                    }
                }
                Err(err) => Err(err),
            }
        };

        if let Some(finally) = finally {
            match self.run_block(ctx, finally, inner.child("finally")).await {
                // A failing finally takes precedence over the body's result.
                Err(err) => return Err(err),
                Ok(BlockOutcome::Suspended(susp)) => return Ok(NodeOutcome::Suspended(susp)),
                Ok(BlockOutcome::Done(_)) => {}
            }
        }
        result.map(NodeOutcome::Value)
    }

    async fn run_catch(
        &self,
        ctx: &RunCtx,
        nodes: &[StepNode],
        inner: &ScopePath,
        error: Value,
    ) -> Result<BlockOutcome, ExecutorError> {
        let catch_scope = inner.child("catch");
        let mut locals = FxHashMap::default();
        locals.insert("error".to_string(), error);
        ctx.set_scope_locals(&catch_scope, locals).await;
        self.run_block(ctx, nodes, catch_scope).await
    }

    async fn execute_while(
        &self,
        ctx: &RunCtx,
        condition: &str,
        body: &[StepNode],
        max_iterations: Option<u32>,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);
        let max = max_iterations.unwrap_or(self.config.default_max_iterations);
        let mut last = Value::Null;
        // Do-while: the body always runs before the condition is checked.
        for iter in 0..max {
            let iter_scope = inner.child(&format!("#{iter}"));
            match self.run_block(ctx, body, iter_scope.clone()).await? {
                BlockOutcome::Suspended(susp) => return Ok(NodeOutcome::Suspended(susp)),
                BlockOutcome::Done(value) => last = value,
            }
            // The condition sees this iteration's outputs and locals.
            let verdict = self.resolve_expr(ctx, &iter_scope, condition).await?;
            if !truthy(&verdict) {
                return Ok(NodeOutcome::Value(last));
            }
        }
        Err(ExecutorError::MaxIterationsExceeded {
            node_id: qid.to_string(),
            max,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_map_reduce(
        &self,
        ctx: &RunCtx,
        items_expr: &str,
        map: &StepNode,
        reduce: &StepNode,
        max_concurrency: Option<usize>,
        scope: &ScopePath,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let inner = ScopePath::from_qualified(qid);
        let items = self.resolve_items(ctx, scope, items_expr, qid).await?;
        let window = max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);

        let mut mapped: Vec<Option<Value>> = vec![None; items.len()];
        let mut next = 0usize;
        let mut pending_suspension: Option<Suspension> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while pending_suspension.is_none() && next < items.len() {
                if in_flight.len() >= window {
                    break;
                }
                let idx = next;
                next += 1;
                let item = items[idx].clone();
                let iter_scope = inner.child(&format!("[{idx}]"));
                in_flight.push(async move {
                    let mut locals = FxHashMap::default();
                    locals.insert("item".to_string(), item);
                    locals.insert("index".to_string(), json!(idx));
                    ctx.set_scope_locals(&iter_scope, locals).await;
                    let out = self.execute_node(ctx, map, iter_scope.clone()).await;
                    (idx, iter_scope, out)
                });
            }

            let Some((idx, iter_scope, outcome)) = in_flight.next().await else {
                break;
            };
            match outcome? {
                NodeOutcome::Suspended(susp) => {
                    if pending_suspension.is_none() {
                        pending_suspension = Some(susp);
                    }
                }
                NodeOutcome::Value(value) => {
                    ctx.record(&iter_scope.qualify(&map.id), value.clone()).await;
                    mapped[idx] = Some(value);
                }
            }
        }
        if let Some(susp) = pending_suspension {
            return Ok(NodeOutcome::Suspended(susp));
        }

        let collected: Vec<Value> = mapped.into_iter().flatten().collect();
        let reduce_scope = inner.child("reduce");
        let mut locals = FxHashMap::default();
        locals.insert("items".to_string(), Value::Array(collected));
        ctx.set_scope_locals(&reduce_scope, locals).await;
        match self.execute_node(ctx, reduce, reduce_scope.clone()).await? {
            NodeOutcome::Suspended(susp) => Ok(NodeOutcome::Suspended(susp)),
            NodeOutcome::Value(value) => {
                ctx.record(&reduce_scope.qualify(&reduce.id), value.clone())
                    .await;
                Ok(NodeOutcome::Value(value))
            }
        }
    }

    async fn resolve_items(
        &self,
        ctx: &RunCtx,
        scope: &ScopePath,
        expr: &str,
        qid: &str,
    ) -> Result<Vec<Value>, ExecutorError> {
        match self.resolve_expr(ctx, scope, expr).await? {
            Value::Array(items) => Ok(items),
            other => Err(ExecutorError::InvalidStepConfig {
                step_id: qid.to_string(),
                reason: format!("items expression `{expr}` resolved to non-array: {other}"),
            }),
        }
    }

    /// Resolve an expression from a node's enclosing scope.
    pub(crate) async fn resolve_expr(
        &self,
        ctx: &RunCtx,
        scope: &ScopePath,
        expr: &str,
    ) -> Result<Value, ExecutorError> {
        let snapshot = ctx.snapshot(scope).await;
        self.resolver
            .resolve(expr, &snapshot)
            .map_err(|source| ExecutorError::Resolve {
                expr: expr.to_string(),
                source,
            })
    }

    async fn resolve_with(
        &self,
        ctx: &RunCtx,
        scope: &ScopePath,
        expr: &str,
        extra: FxHashMap<String, Value>,
    ) -> Result<Value, ExecutorError> {
        let mut snapshot = ctx.snapshot(scope).await;
        snapshot.locals.extend(extra);
        self.resolver
            .resolve(expr, &snapshot)
            .map_err(|source| ExecutorError::Resolve {
                expr: expr.to_string(),
                source,
            })
    }
}

/// Deadline `ms` milliseconds from now, clamped to the representable range.
fn deadline_after(ms: u64) -> DateTime<Utc> {
    let delta = chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl BlockOutcome {
    pub(crate) fn into_outcome(self) -> NodeOutcome {
        match self {
            Self::Done(value) => NodeOutcome::Value(value),
            Self::Suspended(susp) => NodeOutcome::Suspended(susp),
        }
    }
}
