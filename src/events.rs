//! Run-event channel for observing a workflow execution.
//!
//! The executor emits [`RunEvent`]s over a bounded flume channel. Hosts that
//! want live progress subscribe once via
//! [`GraphExecutor::take_events`](crate::runtime::GraphExecutor::take_events);
//! hosts that don't simply never drain the channel. Emission is fire-and-forget:
//! a full or disconnected channel never fails the run.

use serde::Serialize;

use crate::state::SuspensionReason;

/// Lifecycle events emitted while a run executes.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        workflow: String,
    },
    NodeStarted {
        run_id: String,
        path: String,
        kind: String,
    },
    NodeCompleted {
        run_id: String,
        path: String,
    },
    /// A failed attempt will be retried after `delay_ms`.
    RetryScheduled {
        run_id: String,
        path: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The scoring engine recorded an evaluation for a step attempt.
    ScoreRecorded {
        run_id: String,
        path: String,
        attempt: u32,
        score: f64,
        passed: bool,
    },
    /// A losing sibling under `wait_for: any` failed after the winner was
    /// chosen; its outcome is discarded.
    SiblingDiscarded {
        run_id: String,
        path: String,
        error: String,
    },
    RunSuspended {
        run_id: String,
        node: String,
        reason: SuspensionReason,
    },
    RunResumed {
        run_id: String,
        node: String,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

/// Cheap-to-clone sender half of the run-event channel.
#[derive(Clone)]
pub struct EventEmitter {
    tx: flume::Sender<RunEvent>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

impl EventEmitter {
    /// Emit an event, dropping it if the channel is full or the subscriber
    /// is gone.
    pub fn emit(&self, event: RunEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::trace!(?err, "run event dropped");
        }
    }
}

/// Receiver half of the run-event channel.
pub type EventStream = flume::Receiver<RunEvent>;

/// Create a bounded event channel.
#[must_use]
pub fn channel(capacity: usize) -> (EventEmitter, EventStream) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (EventEmitter { tx }, rx)
}
