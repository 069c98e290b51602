#![allow(dead_code)]

use std::sync::Arc;

use cloudpipe::Operation;
use cloudpipe::pipeline::{Pipeline, PipelineEvent, PipelineOptions};
use cloudpipe::registry::Registry;
use cloudpipe::store::MemoryStore;
use cloudpipe::types::PipelineAlgorithm;
use tokio::sync::broadcast;

pub use cloudpipe_test_utils::{
    OperationBuilder, RecordingDelegate, init_tracing, with_timeout,
};

/// Registry over a fresh in-memory store; the store handle is returned so
/// tests can reopen it.
pub fn memory_registry() -> (Registry, MemoryStore) {
    init_tracing();
    let store = MemoryStore::new();
    (Registry::new(store.clone()), store)
}

pub fn options(algorithm: PipelineAlgorithm, max_concurrent: usize) -> PipelineOptions {
    PipelineOptions {
        algorithm,
        max_concurrent_operation_count: max_concurrent,
        ..PipelineOptions::default()
    }
}

/// Register a pipeline named `name` backed by a fresh recording delegate.
pub fn register(
    registry: &Registry,
    name: &str,
    options: PipelineOptions,
) -> (Pipeline, Arc<RecordingDelegate>) {
    let delegate = RecordingDelegate::new();
    let pipeline = registry
        .register(Pipeline::with_options(name, options, delegate.clone()))
        .expect("register pipeline");
    (pipeline, delegate)
}

/// Commit one transaction adding `ops` as a new graph.
pub fn add_graph(registry: &Registry, pipeline: &str, ops: &[&Operation]) -> u64 {
    let mut tx = registry.begin();
    for op in ops {
        tx.add_operation(pipeline, (*op).clone());
    }
    registry.commit(tx).expect("commit")
}

pub fn complete(registry: &Registry, pipeline: &str, op: &Operation) {
    let mut tx = registry.begin();
    tx.complete_operation(pipeline, op);
    registry.commit(tx).expect("commit");
}

pub fn skip(registry: &Registry, pipeline: &str, op: &Operation) {
    let mut tx = registry.begin();
    tx.skip_operation(pipeline, op);
    registry.commit(tx).expect("commit");
}

/// Everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
