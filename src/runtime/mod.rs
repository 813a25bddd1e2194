//! The graph executor: run, resume, and expire workflow executions.
//!
//! One [`GraphExecutor`] wraps one [`Workflow`] plus its collaborators (step
//! registry, expression resolver, state store, optional scoring engine). It
//! is cheap to keep around and can drive many runs; each run's durable record
//! lives in the store, never in the executor.

pub mod config;
pub mod context;
mod control;
mod scope;
mod step;

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

use crate::cache::StepCache;
use crate::errors::ExecutorError;
use crate::events::{EventEmitter, EventStream, RunEvent};
use crate::graphs::node::StepNode;
use crate::graphs::{Workflow, WorkflowNodes, validate};
use crate::resolver::{ExpressionResolver, KeyPathResolver};
use crate::scoring::ScoringEngine;
use crate::state::{ExecutionState, OnSuspendTimeout, RunHandle, RunStatus, Suspension};
use crate::step::{InMemoryRegistry, StepRegistry};
use crate::store::{InMemoryStateStore, StateStore};
use crate::utils::id_generator::IdGenerator;

pub use config::ExecutorConfig;
pub use context::{RunCtx, ScopePath};

use scope::{BlockOutcome, ScopeOutcome};

/// Drives runs of a single workflow.
pub struct GraphExecutor {
    pub(crate) workflow: Workflow,
    pub(crate) registry: Arc<dyn StepRegistry>,
    pub(crate) resolver: Arc<dyn ExpressionResolver>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) scoring: Option<ScoringEngine>,
    pub(crate) config: ExecutorConfig,
    pub(crate) cache: StepCache,
    pub(crate) emitter: EventEmitter,
    pub(crate) ids: IdGenerator,
    events: Mutex<Option<EventStream>>,
}

impl std::fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("workflow", &self.workflow.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GraphExecutor {
    /// Executor with reference collaborators: in-memory registry, key-path
    /// resolver, in-memory store, no scoring.
    #[must_use]
    pub fn new(workflow: Workflow) -> Self {
        Self::with_config(workflow, ExecutorConfig::default())
    }

    #[must_use]
    pub fn with_config(workflow: Workflow, config: ExecutorConfig) -> Self {
        let (emitter, events) = crate::events::channel(config.event_capacity);
        Self {
            workflow,
            registry: Arc::new(InMemoryRegistry::new()),
            resolver: Arc::new(KeyPathResolver::new()),
            store: Arc::new(InMemoryStateStore::new()),
            scoring: None,
            config,
            cache: StepCache::new(),
            emitter,
            ids: IdGenerator::new(),
            events: Mutex::new(Some(events)),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: impl StepRegistry + 'static) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: impl ExpressionResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_scoring(mut self, engine: ScoringEngine) -> Self {
        self.scoring = Some(engine);
        self
    }

    /// Take the run-event stream. One subscriber per executor; subsequent
    /// calls return `None`.
    pub fn take_events(&self) -> Option<EventStream> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Start a new run with the given input payload.
    #[instrument(skip_all, fields(workflow = %self.workflow.name))]
    pub async fn run(&self, input: Value) -> Result<RunHandle, ExecutorError> {
        let run_id = self.ids.generate_run_id();
        let (nodes, generated) = match &self.workflow.nodes {
            WorkflowNodes::Static(nodes) => (nodes.clone(), false),
            WorkflowNodes::Generated(generator) => (generator.generate(&input)?, true),
        };
        validate(&nodes)?;

        let mut state = ExecutionState::new(&run_id, &self.workflow.name, input);
        state.status = RunStatus::Running;
        if generated {
            state.generated_nodes = Some(nodes.clone());
        }
        self.store.save(&state).await?;
        self.emitter.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: self.workflow.name.clone(),
        });
        info!(run_id, "run started");

        self.drive(state, &nodes).await
    }

    /// Resume a suspended run by presenting its resume token and a payload,
    /// which becomes the suspended node's output.
    #[instrument(skip(self, payload, token))]
    pub async fn resume(
        &self,
        run_id: &str,
        token: &str,
        payload: Value,
    ) -> Result<RunHandle, ExecutorError> {
        let state = self.store.load(run_id).await?;
        let suspension = self.pending_suspension(&state, token)?;
        let nodes = self.nodes_for(&state)?;

        let mut state = state;
        state
            .outputs
            .insert(suspension.node_id.clone(), payload);
        state.completed.insert(suspension.node_id.clone());
        state.suspension = None;
        state.status = RunStatus::Running;
        state.touch();
        self.store.save(&state).await?;
        self.emitter.emit(RunEvent::RunResumed {
            run_id: run_id.to_string(),
            node: suspension.node_id.clone(),
        });
        info!(node = %suspension.node_id, "run resumed");

        self.drive(state, &nodes).await
    }

    /// Apply a suspension's timeout policy after its deadline passed. Called
    /// by the host's scheduler; this is also how sleeps wake up.
    #[instrument(skip(self, token))]
    pub async fn expire(&self, run_id: &str, token: &str) -> Result<RunHandle, ExecutorError> {
        let state = self.store.load(run_id).await?;
        let suspension = self.pending_suspension(&state, token)?;
        match suspension.on_timeout.clone() {
            OnSuspendTimeout::Fail => {
                let err = ExecutorError::SuspensionTimeout {
                    run_id: run_id.to_string(),
                    node_id: suspension.node_id.clone(),
                };
                let mut state = state;
                state.status = RunStatus::Failed;
                state.error = Some(err.to_value());
                state.touch();
                self.store.save(&state).await?;
                self.emitter.emit(RunEvent::RunFailed {
                    run_id: run_id.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
            OnSuspendTimeout::ContinueWithFallback { fallback } => {
                self.resume(run_id, token, fallback).await
            }
        }
    }

    fn pending_suspension(
        &self,
        state: &ExecutionState,
        token: &str,
    ) -> Result<Suspension, ExecutorError> {
        if state.status != RunStatus::Suspended {
            return Err(ExecutorError::NotSuspended {
                run_id: state.run_id.clone(),
                status: state.status,
            });
        }
        let suspension = state
            .suspension
            .clone()
            .ok_or_else(|| ExecutorError::Internal("suspended run without suspension".into()))?;
        if suspension.resume_token != token {
            return Err(ExecutorError::InvalidResumeToken {
                run_id: state.run_id.clone(),
            });
        }
        Ok(suspension)
    }

    fn nodes_for(&self, state: &ExecutionState) -> Result<Vec<StepNode>, ExecutorError> {
        if let Some(nodes) = &state.generated_nodes {
            return Ok(nodes.clone());
        }
        match &self.workflow.nodes {
            WorkflowNodes::Static(nodes) => Ok(nodes.clone()),
            WorkflowNodes::Generated(_) => Err(ExecutorError::Internal(
                "generated workflow run has no persisted node list".into(),
            )),
        }
    }

    /// Drive a run to its next resting state: completed, suspended, failed.
    async fn drive(
        &self,
        state: ExecutionState,
        nodes: &[StepNode],
    ) -> Result<RunHandle, ExecutorError> {
        let ctx = RunCtx::new(state, self.workflow.metadata.clone());
        match self.run_to_rest(&ctx, nodes).await {
            Ok(RestingState::Completed(output)) => {
                {
                    let mut shared = ctx.shared.lock().await;
                    if !shared.scoring.history.is_empty() {
                        shared.scoring.final_score = Some(shared.scoring.metrics().ensemble_score);
                    }
                }
                let mut state = ctx.snapshot_state(RunStatus::Completed).await;
                state.output = Some(output);
                self.store.save(&state).await?;
                self.emitter.emit(RunEvent::RunCompleted {
                    run_id: state.run_id.clone(),
                });
                info!(run_id = %state.run_id, "run completed");
                Ok(RunHandle::from(&state))
            }
            Ok(RestingState::Suspended(suspension)) => {
                let mut state = ctx.snapshot_state(RunStatus::Suspended).await;
                state.suspension = Some(suspension.clone());
                // The suspension must be durable before it is reported;
                // a lost record would strand the resume token.
                self.store.save(&state).await?;
                self.emitter.emit(RunEvent::RunSuspended {
                    run_id: state.run_id.clone(),
                    node: suspension.node_id.clone(),
                    reason: suspension.reason,
                });
                info!(run_id = %state.run_id, node = %suspension.node_id, "run suspended");
                Ok(RunHandle::from(&state))
            }
            Err(err) => {
                let mut state = ctx.snapshot_state(RunStatus::Failed).await;
                state.error = Some(err.to_value());
                if let Err(save_err) = self.store.save(&state).await {
                    warn!(run_id = %state.run_id, %save_err, "failed to persist failed run");
                }
                self.emitter.emit(RunEvent::RunFailed {
                    run_id: state.run_id.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_to_rest(
        &self,
        ctx: &RunCtx,
        nodes: &[StepNode],
    ) -> Result<RestingState, ExecutorError> {
        match self.run_scope(ctx, nodes, ScopePath::root()).await? {
            ScopeOutcome::Suspended(suspension) => Ok(RestingState::Suspended(suspension)),
            ScopeOutcome::Completed => {
                let output = match &self.workflow.output {
                    Some(expr) => self.resolve_expr(ctx, &ScopePath::root(), expr).await?,
                    None => match self.run_block(ctx, nodes, ScopePath::root()).await? {
                        BlockOutcome::Done(value) => value,
                        BlockOutcome::Suspended(_) => Value::Null,
                    },
                };
                Ok(RestingState::Completed(output))
            }
        }
    }
}

enum RestingState {
    Completed(Value),
    Suspended(Suspension),
}
