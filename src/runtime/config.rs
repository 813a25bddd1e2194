//! Executor tuning knobs.

use std::num::NonZeroUsize;

/// Runtime configuration for a [`GraphExecutor`](super::GraphExecutor).
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently executing nodes within one scope. Also
    /// the iteration window for `foreach`/`map_reduce` nodes that declare no
    /// `max_concurrency` of their own.
    pub max_concurrency: usize,
    /// Iteration ceiling applied to `while` loops without an explicit
    /// `max_iterations`.
    pub default_max_iterations: u32,
    /// Persist run state after every completed node instead of only at
    /// lifecycle transitions. Trades store traffic for a tighter resume point.
    pub autosave_each_node: bool,
    /// Bound on the run-event channel; overflow drops events.
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            default_max_iterations: 100,
            autosave_each_node: false,
            event_capacity: 1024,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_default_max_iterations(mut self, limit: u32) -> Self {
        self.default_max_iterations = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_autosave_each_node(mut self, enabled: bool) -> Self {
        self.autosave_each_node = enabled;
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
