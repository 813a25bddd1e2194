//! In-process step-output cache.
//!
//! Keys are either declared on the step's `CachePolicy` or derived from the
//! qualified step id plus a hash of the resolved input. Entries live for the
//! policy's TTL (or forever without one) and are shared across runs on the
//! same executor.

use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Mutex-guarded cache map. Contention is negligible: the critical section is
/// a map probe, never a step invocation.
#[derive(Debug, Default)]
pub struct StepCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
}

impl StepCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry, evicting it if expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at.is_none_or(|at| Instant::now() < at) => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.lock().insert(key.into(), entry);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, CacheEntry>> {
        // A poisoned lock only means another thread panicked mid-probe; the
        // map itself is still coherent.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Derived cache key: qualified step id plus a stable hash of the resolved
/// input value.
#[must_use]
pub fn derive_key(step_id: &str, input: &Value) -> String {
    let mut hasher = FxHasher::default();
    step_id.hash(&mut hasher);
    input.to_string().hash(&mut hasher);
    format!("{step_id}:{:016x}", hasher.finish())
}
