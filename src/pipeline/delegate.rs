// src/pipeline/delegate.rs

//! Pluggable executor abstraction.
//!
//! The pipeline hands ready operations to a `PipelineDelegate` instead of
//! performing any work itself. The delegate does the network I/O (or
//! whatever the operation stands for) and later reports the outcome through
//! a transaction: complete, skip, or back to pending for a retry.
//!
//! - `ChannelDelegate` forwards started operations over an mpsc channel to
//!   an executor task; it is what the binary and most services use.
//! - Tests provide their own delegate that records what was started.

use tokio::sync::mpsc;
use tracing::warn;

use crate::operation::Operation;
use crate::pipeline::Pipeline;

/// Receives operations the pipeline has marked Active.
///
/// `start_operation` is always called without any pipeline lock held, so an
/// implementation may call back into `pipeline` (query status, set a hold,
/// move the operation back to pending). It must not block on a commit; spawn
/// the work and commit from there.
pub trait PipelineDelegate: Send + Sync {
    fn start_operation(&self, pipeline: &Pipeline, operation: Operation);
}

/// A started operation, tagged with the pipeline that started it.
#[derive(Debug, Clone)]
pub struct StartedOperation {
    pub pipeline: String,
    pub operation: Operation,
}

/// Delegate that forwards every started operation over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<StartedOperation>,
}

impl ChannelDelegate {
    /// Create the delegate together with the receiving end for the executor.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StartedOperation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PipelineDelegate for ChannelDelegate {
    fn start_operation(&self, pipeline: &Pipeline, operation: Operation) {
        let uuid = operation.uuid();
        let started = StartedOperation {
            pipeline: pipeline.name().to_string(),
            operation,
        };

        // Moving the operation back to pending here would re-dispatch it
        // straight into the closed channel; it stays Active until the caller
        // reconciles it.
        if self.tx.send(started).is_err() {
            warn!(
                pipeline = %pipeline.name(),
                operation = %uuid,
                "executor channel closed; operation left active"
            );
        }
    }
}
