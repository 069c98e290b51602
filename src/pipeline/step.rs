// src/pipeline/step.rs

//! Result types for a single pipeline state transition.

use uuid::Uuid;

use crate::operation::Operation;

/// Notification published after a pipeline changes.
///
/// Events are written to a broadcast channel; subscribers decide on which
/// thread or task they are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The queue changed as the result of an applied commit.
    QueueChanged {
        pipeline: String,
        /// Operations that formed a new graph for the commit's snapshot.
        added: Vec<Uuid>,
        /// Operations inserted into the graph of an earlier snapshot.
        inserted: Vec<Uuid>,
        modified: Vec<Uuid>,
        /// Completed or skipped operations reaped from the queue.
        removed: Vec<Uuid>,
    },
    SuspendCountChanged {
        pipeline: String,
        suspend_count: usize,
    },
    ActiveStatusChanged {
        pipeline: String,
        is_active: bool,
    },
}

/// Structured result of one pipeline "step".
///
/// Produced while the pipeline lock is held; carried out (dispatch, event
/// publication) only after the lock is released.
#[derive(Debug, Clone, Default)]
pub struct PipelineStep {
    /// Operations that were marked Active and must be handed to the delegate.
    pub dispatch: Vec<Operation>,
    pub events: Vec<PipelineEvent>,
}

impl PipelineStep {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.events.is_empty()
    }
}
