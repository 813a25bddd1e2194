//! # weftflow
//!
//! A durable workflow engine: workflows are explicit graphs of typed nodes
//! (steps, parallels, branches, loops, map/reduce, suspensions) executed
//! concurrently where dependencies allow, with per-step retry, timeout,
//! caching, and output-scoring policies.
//!
//! The pieces:
//!
//! - [`graphs`] — node types, per-step policies, structural validation
//! - [`runtime`] — the [`GraphExecutor`]: run, resume, expire
//! - [`step`] — the [`StepHandler`](step::StepHandler) seam external work
//!   plugs into
//! - [`resolver`] — pluggable expression resolution for conditions and inputs
//! - [`scoring`] — evaluator-driven quality gating and metrics
//! - [`store`] — durable run storage behind
//!   [`StateStore`](store::StateStore)
//! - [`events`] — best-effort run-event stream for observers
//!
//! ## A minimal run
//!
//! ```no_run
//! use serde_json::json;
//! use weftflow::graphs::{StepNode, Workflow};
//! use weftflow::runtime::GraphExecutor;
//! use weftflow::step::InMemoryRegistry;
//! use weftflow::utils::testing::EchoStep;
//!
//! # async fn demo() -> Result<(), weftflow::ExecutorError> {
//! let workflow = Workflow::new("echo", vec![StepNode::step("echo", "echo")]);
//! let executor = GraphExecutor::new(workflow)
//!     .with_registry(InMemoryRegistry::new().register("echo", EchoStep));
//! let handle = executor.run(json!({"hello": "world"})).await?;
//! assert_eq!(handle.output, Some(json!({"hello": "world"})));
//! # Ok(())
//! # }
//! ```
//!
//! Suspension is durable state, not a parked task: a suspended run is a
//! record in the store plus a resume token, resumable from any process that
//! can load it.

pub mod cache;
pub mod context;
pub mod errors;
pub mod events;
pub mod graphs;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod scoring;
pub mod state;
pub mod step;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use errors::ExecutorError;
pub use runtime::{ExecutorConfig, GraphExecutor};
pub use state::{RunHandle, RunStatus};
