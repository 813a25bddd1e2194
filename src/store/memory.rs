//! In-memory reference store.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use super::persistence::PersistedRun;
use super::{StateStore, StoreError};
use crate::state::ExecutionState;

/// Map-backed store that still serializes every record through the
/// [`PersistedRun`] envelope, so snapshots are isolated from the live run and
/// the persistence path is exercised even in tests.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    runs: RwLock<FxHashMap<String, String>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<(), StoreError> {
        let raw = PersistedRun::envelope(state.clone()).to_json()?;
        self.runs.write().await.insert(state.run_id.clone(), raw);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<ExecutionState, StoreError> {
        let raw = {
            let runs = self.runs.read().await;
            runs.get(run_id).cloned().ok_or_else(|| StoreError::NotFound {
                run_id: run_id.to_string(),
            })?
        };
        Ok(PersistedRun::from_json(&raw)?.state)
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs.write().await.remove(run_id);
        Ok(())
    }
}
