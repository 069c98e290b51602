use std::sync::{Arc, Mutex};

use cloudpipe::pipeline::{Pipeline, PipelineDelegate};
use cloudpipe::{Operation, OperationStatus};
use uuid::Uuid;

/// One `start_operation` call as seen by the delegate.
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub pipeline: String,
    pub operation: Operation,
    /// Status the pipeline reported when queried from inside the callback.
    pub observed_status: Option<OperationStatus>,
}

/// A fake delegate that:
/// - records every started operation
/// - queries the pipeline from inside the callback (it must not deadlock)
/// - never completes anything; tests commit outcomes themselves.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate {
    started: Arc<Mutex<Vec<StartRecord>>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<StartRecord> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_uuids(&self) -> Vec<Uuid> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.operation.uuid())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Drain the recorded starts.
    pub fn take(&self) -> Vec<StartRecord> {
        std::mem::take(&mut *self.started.lock().unwrap())
    }
}

impl PipelineDelegate for RecordingDelegate {
    fn start_operation(&self, pipeline: &Pipeline, operation: Operation) {
        let observed_status = pipeline.status(&operation.uuid());
        self.started.lock().unwrap().push(StartRecord {
            pipeline: pipeline.name().to_string(),
            operation,
            observed_status,
        });
    }
}
