mod common;

use cloudpipe::OperationStatus;
use cloudpipe::pipeline::PipelineEvent;
use cloudpipe::types::PipelineAlgorithm;

use common::{
    OperationBuilder, add_graph, complete, drain_events, memory_registry, options, register,
};

#[test]
fn limit_of_one_runs_operations_one_at_a_time() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 1));

    let op_x = OperationBuilder::new().build();
    let op_y = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&op_x, &op_y]);

    assert_eq!(pipeline.active_operations().len(), 1);
    assert_eq!(delegate.started_uuids(), vec![op_x.uuid()]);
    assert_eq!(pipeline.status(&op_y.uuid()), Some(OperationStatus::Pending));

    complete(&registry, "uploads", &op_x);
    assert_eq!(pipeline.active_operations().len(), 1);
    assert_eq!(pipeline.status(&op_y.uuid()), Some(OperationStatus::Active));
}

#[test]
fn zero_limit_is_unbounded() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 0));

    let ops: Vec<_> = (0..20).map(|_| OperationBuilder::new().build()).collect();
    let refs: Vec<_> = ops.iter().collect();
    add_graph(&registry, "uploads", &refs);

    assert_eq!(delegate.count(), 20);
    assert_eq!(pipeline.active_operations().len(), 20);
}

#[test]
fn default_limit_is_eight() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", Default::default());
    assert_eq!(pipeline.max_concurrent_operation_count(), 8);

    let ops: Vec<_> = (0..10).map(|_| OperationBuilder::new().build()).collect();
    let refs: Vec<_> = ops.iter().collect();
    add_graph(&registry, "uploads", &refs);

    assert_eq!(delegate.count(), 8);
}

#[test]
fn raising_the_limit_dispatches_immediately() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 1));

    let ops: Vec<_> = (0..3).map(|_| OperationBuilder::new().build()).collect();
    let refs: Vec<_> = ops.iter().collect();
    add_graph(&registry, "uploads", &refs);
    assert_eq!(delegate.count(), 1);

    pipeline.set_max_concurrent_operation_count(3);
    assert_eq!(delegate.count(), 3);

    // Lowering it never cancels running work.
    pipeline.set_max_concurrent_operation_count(1);
    assert_eq!(pipeline.active_operations().len(), 3);
}

#[test]
fn suspended_pipeline_dispatches_nothing_until_resumed() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    assert_eq!(pipeline.suspend(), 1);
    assert_eq!(pipeline.suspend(), 2);
    assert!(pipeline.is_suspended());

    let op = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&op]);
    assert_eq!(delegate.count(), 0);
    assert!(!pipeline.is_active());

    assert_eq!(pipeline.resume(), 1);
    assert_eq!(delegate.count(), 0);

    assert_eq!(pipeline.resume(), 0);
    assert_eq!(delegate.started_uuids(), vec![op.uuid()]);
    assert!(pipeline.is_active());
}

#[test]
fn resume_clamps_at_zero() {
    let (registry, _store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    assert_eq!(pipeline.resume(), 0);
    assert_eq!(pipeline.suspend_count(), 0);
    assert_eq!(pipeline.suspend(), 1);
    assert_eq!(pipeline.resume(), 0);
    assert_eq!(pipeline.resume(), 0);
}

#[test]
fn suspend_with_count_adds_in_bulk() {
    let (registry, _store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    assert_eq!(pipeline.suspend_with_count(3), 3);
    assert_eq!(pipeline.suspend_with_count(0), 3);
    assert_eq!(pipeline.resume(), 2);
}

#[test]
fn suspend_leaves_active_operations_running() {
    let (registry, _store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let running = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&running]);
    pipeline.suspend();

    assert_eq!(pipeline.status(&running.uuid()), Some(OperationStatus::Active));
    assert!(pipeline.is_active());
}

#[test]
fn suspend_count_changes_are_published() {
    let (registry, _store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    let mut rx = pipeline.subscribe();

    pipeline.suspend();
    pipeline.resume();
    pipeline.resume();

    let counts: Vec<usize> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::SuspendCountChanged { suspend_count, .. } => Some(suspend_count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![1, 0]);
}

#[test]
fn set_status_pending_retries_and_active_marks_in_flight() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 1));

    let first = OperationBuilder::new().build();
    let second = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&first, &second]);
    assert_eq!(delegate.started_uuids(), vec![first.uuid()]);

    // Retry: back to pending frees the slot and the next pass picks it again.
    pipeline.set_status_pending(&first.uuid());
    assert_eq!(delegate.started_uuids(), vec![first.uuid(), first.uuid()]);

    // Equal status writes are no-ops.
    pipeline.set_status_active(&first.uuid());
    assert_eq!(delegate.count(), 2);

    pipeline.set_max_concurrent_operation_count(2);
    let dispatched_before = delegate.count();
    assert_eq!(dispatched_before, 3);
    complete(&registry, "uploads", &first);
    complete(&registry, "uploads", &second);
    assert_eq!(pipeline.graph_count(), 0);

    let third = OperationBuilder::new().build();
    let fourth = OperationBuilder::new().build();
    pipeline.suspend();
    add_graph(&registry, "uploads", &[&third, &fourth]);

    // Marking one active by hand consumes a slot without a dispatch.
    pipeline.set_status_active(&third.uuid());
    assert_eq!(pipeline.status(&third.uuid()), Some(OperationStatus::Active));
    assert_eq!(delegate.count(), dispatched_before);

    pipeline.set_max_concurrent_operation_count(1);
    pipeline.resume();
    assert_eq!(pipeline.status(&fourth.uuid()), Some(OperationStatus::Pending));
    assert_eq!(delegate.count(), dispatched_before);
}

#[test]
fn status_writes_to_unknown_operations_are_ignored() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let ghost = OperationBuilder::new().build();
    pipeline.set_status_pending(&ghost.uuid());
    pipeline.set_status_active(&ghost.uuid());

    assert_eq!(pipeline.status(&ghost.uuid()), None);
    assert_eq!(delegate.count(), 0);
}
