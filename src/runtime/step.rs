//! Leaf step execution: input resolution, caching, timeout, retry, scoring,
//! and declared state writes.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::GraphExecutor;
use super::context::{RunCtx, ScopePath, plan_state_writes};
use super::scope::NodeOutcome;
use crate::cache::derive_key;
use crate::context::ContextSnapshot;
use crate::errors::ExecutorError;
use crate::events::RunEvent;
use crate::graphs::node::StepSpec;
use crate::retry;
use crate::scoring::ScoreDecision;
use crate::step::{StepContext, StepError};

impl GraphExecutor {
    pub(crate) async fn execute_step(
        &self,
        ctx: &RunCtx,
        spec: &StepSpec,
        scope: &ScopePath,
        qid: &str,
    ) -> Result<NodeOutcome, ExecutorError> {
        let handler = self
            .registry
            .get(&spec.handler)
            .ok_or_else(|| ExecutorError::StepNotFound {
                step_id: qid.to_string(),
                handler: spec.handler.clone(),
            })?;

        let mut attempt: u32 = 0;
        loop {
            let snapshot = ctx.snapshot(scope).await;
            let input = match &spec.input {
                Some(expr) => {
                    self.resolver
                        .resolve(expr, &snapshot)
                        .map_err(|source| ExecutorError::Resolve {
                            expr: expr.clone(),
                            source,
                        })?
                }
                None => default_input(&snapshot),
            };

            let cache_key = spec.cache.as_ref().filter(|c| !c.bypass).map(|c| {
                c.key
                    .clone()
                    .unwrap_or_else(|| derive_key(qid, &input))
            });
            if let Some(key) = &cache_key {
                if let Some(hit) = self.cache.get(key) {
                    debug!(path = %qid, key, "cache hit");
                    self.apply_step_state_writes(ctx, spec, scope, &hit).await?;
                    return Ok(NodeOutcome::Value(hit));
                }
            }

            let step_ctx = StepContext {
                run_id: ctx.base.run_id.clone(),
                step_id: qid.to_string(),
                attempt,
                snapshot,
                emitter: self.emitter.clone(),
            };
            let invocation = handler.invoke(input, step_ctx);
            let result = match &spec.timeout {
                Some(policy) => {
                    let deadline = Duration::from_millis(policy.timeout_ms);
                    // A timed-out attempt is cancelled by dropping its future.
                    match tokio::time::timeout(deadline, invocation).await {
                        Ok(result) => result,
                        Err(_) => match &policy.fallback {
                            Some(fallback) => Ok(fallback.clone()),
                            None => Err(StepError::new(
                                "timeout",
                                format!("attempt exceeded {}ms", policy.timeout_ms),
                            )),
                        },
                    }
                }
                None => invocation.await,
            };

            match result {
                Ok(output) => {
                    if let Some(policy) = &spec.scoring {
                        let engine = self.scoring.as_ref().ok_or_else(|| {
                            ExecutorError::InvalidStepConfig {
                                step_id: qid.to_string(),
                                reason: "scoring policy configured without an evaluator".into(),
                            }
                        })?;
                        // The evaluator may be slow; keep it outside the lock.
                        let evaluation = engine
                            .evaluator()
                            .score(&output, &policy.criteria)
                            .await
                            .map_err(|source| ExecutorError::StepExecutionFailed {
                                step_id: qid.to_string(),
                                attempts: attempt + 1,
                                source,
                            })?;
                        let decision = {
                            let mut shared = ctx.shared.lock().await;
                            let (entry, decision) =
                                engine.apply(qid, attempt, evaluation, policy, &mut shared.scoring);
                            self.emitter.emit(RunEvent::ScoreRecorded {
                                run_id: ctx.base.run_id.clone(),
                                path: qid.to_string(),
                                attempt,
                                score: entry.score,
                                passed: entry.passed,
                            });
                            decision
                        };
                        match decision {
                            ScoreDecision::Retry => {
                                debug!(path = %qid, attempt, "quality retry");
                                attempt += 1;
                                continue;
                            }
                            ScoreDecision::Abort => {
                                return Err(ExecutorError::StepExecutionFailed {
                                    step_id: qid.to_string(),
                                    attempts: attempt + 1,
                                    source: StepError::new(
                                        "score_below_threshold",
                                        format!(
                                            "output scored below the {:.2} minimum",
                                            policy.minimum
                                        ),
                                    ),
                                });
                            }
                            ScoreDecision::Accept | ScoreDecision::Continue => {}
                        }
                    }

                    if let (Some(key), Some(cache)) = (cache_key, &spec.cache) {
                        let ttl = cache.ttl_ms.map(Duration::from_millis);
                        self.cache.put(key, output.clone(), ttl);
                    }
                    self.apply_step_state_writes(ctx, spec, scope, &output).await?;
                    return Ok(NodeOutcome::Value(output));
                }
                Err(step_err) => {
                    if let Some(policy) = &spec.retry {
                        let decision = retry::evaluate(policy, attempt, &step_err);
                        if decision.retry {
                            self.emitter.emit(RunEvent::RetryScheduled {
                                run_id: ctx.base.run_id.clone(),
                                path: qid.to_string(),
                                attempt,
                                delay_ms: decision.delay.as_millis() as u64,
                            });
                            debug!(
                                path = %qid,
                                attempt,
                                delay_ms = decision.delay.as_millis() as u64,
                                code = %step_err.code,
                                "retrying step"
                            );
                            tokio::time::sleep(decision.delay).await;
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(terminal_error(spec, qid, attempt, step_err));
                }
            }
        }
    }

    async fn apply_step_state_writes(
        &self,
        ctx: &RunCtx,
        spec: &StepSpec,
        scope: &ScopePath,
        output: &Value,
    ) -> Result<(), ExecutorError> {
        let Some(access) = &spec.state_access else {
            return Ok(());
        };
        if access.set.is_empty() {
            return Ok(());
        }
        let mut snapshot = ctx.snapshot(scope).await;
        snapshot
            .locals
            .insert("output".to_string(), output.clone());
        let mut resolved = Vec::with_capacity(access.set.len());
        for write in &access.set {
            match &write.value {
                Some(expr) => {
                    let value = self.resolver.resolve(expr, &snapshot).map_err(|source| {
                        ExecutorError::Resolve {
                            expr: expr.clone(),
                            source,
                        }
                    })?;
                    resolved.push(Some(value));
                }
                None => resolved.push(None),
            }
        }
        ctx.apply_state_writes(plan_state_writes(&access.set, resolved, output))
            .await;
        Ok(())
    }
}

/// Input when the step declares no expression: the reduce `items` local, the
/// foreach `item` local, or the workflow input.
fn default_input(snapshot: &ContextSnapshot) -> Value {
    if let Some(items) = snapshot.locals.get("items") {
        return items.clone();
    }
    if let Some(item) = snapshot.locals.get("item") {
        return item.clone();
    }
    snapshot.input.clone()
}

fn terminal_error(spec: &StepSpec, qid: &str, attempt: u32, err: StepError) -> ExecutorError {
    if err.code == "timeout" {
        if let Some(policy) = &spec.timeout {
            return ExecutorError::Timeout {
                step_id: qid.to_string(),
                timeout_ms: policy.timeout_ms,
            };
        }
    }
    ExecutorError::StepExecutionFailed {
        step_id: qid.to_string(),
        attempts: attempt + 1,
        source: err,
    }
}
