//! Durable run storage seam.
//!
//! The executor persists [`ExecutionState`] through a [`StateStore`] at every
//! lifecycle transition (and optionally after every node). The in-memory
//! store is the reference implementation; database-backed stores implement
//! the same three-method trait and serialize through the
//! [`PersistedRun`](persistence::PersistedRun) envelope.

pub mod memory;
pub mod persistence;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::state::ExecutionState;

pub use memory::InMemoryStateStore;
pub use persistence::{PERSISTENCE_FORMAT_VERSION, PersistedRun};

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("run `{run_id}` not found")]
    #[diagnostic(code(weftflow::store::not_found))]
    NotFound { run_id: String },

    #[error("run record serialization failed")]
    #[diagnostic(code(weftflow::store::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("unsupported run record format version {found} (expected {expected})")]
    #[diagnostic(
        code(weftflow::store::format_version),
        help("the record was written by an incompatible engine version")
    )]
    FormatVersion { found: u32, expected: u32 },

    #[error("storage backend error: {0}")]
    #[diagnostic(code(weftflow::store::backend))]
    Backend(String),
}

/// Persistence for run state, keyed by run id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &ExecutionState) -> Result<(), StoreError>;
    async fn load(&self, run_id: &str) -> Result<ExecutionState, StoreError>;
    /// Deleting an absent run is not an error.
    async fn delete(&self, run_id: &str) -> Result<(), StoreError>;
}
