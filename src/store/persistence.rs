//! Versioned serialization envelope for durable run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::state::ExecutionState;

/// Current on-disk format version. Bump on any breaking change to
/// [`ExecutionState`]'s serialized shape.
pub const PERSISTENCE_FORMAT_VERSION: u32 = 1;

/// What actually gets written to a backend: the run state plus enough
/// framing to reject records from an incompatible engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedRun {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: ExecutionState,
}

impl PersistedRun {
    #[must_use]
    pub fn envelope(state: ExecutionState) -> Self {
        Self {
            format_version: PERSISTENCE_FORMAT_VERSION,
            saved_at: Utc::now(),
            state,
        }
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let record: Self = serde_json::from_str(raw)?;
        if record.format_version != PERSISTENCE_FORMAT_VERSION {
            return Err(StoreError::FormatVersion {
                found: record.format_version,
                expected: PERSISTENCE_FORMAT_VERSION,
            });
        }
        Ok(record)
    }
}
