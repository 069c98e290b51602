mod common;

use std::sync::Barrier;

use chrono::{Duration, Utc};
use cloudpipe::commit::Commit;
use cloudpipe::pipeline::PipelineCore;
use cloudpipe::registry::Registry;
use cloudpipe::types::PipelineAlgorithm;
use cloudpipe::{Operation, OperationStatus};

use common::{OperationBuilder, add_graph, memory_registry, options, register};

#[test]
fn hold_blocks_until_cleared() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let op_z = OperationBuilder::new().build();
    pipeline.suspend();
    add_graph(&registry, "uploads", &[&op_z]);
    pipeline.set_hold(&op_z.uuid(), "network", Some(Utc::now() + Duration::seconds(60)));
    pipeline.resume();

    assert_eq!(delegate.count(), 0);
    assert_eq!(
        pipeline.status_and_hold(&op_z.uuid()),
        Some((OperationStatus::Pending, true))
    );

    pipeline.set_hold(&op_z.uuid(), "network", None);
    assert_eq!(delegate.started_uuids(), vec![op_z.uuid()]);
    assert_eq!(
        pipeline.status_and_hold(&op_z.uuid()),
        Some((OperationStatus::Active, false))
    );
}

#[test]
fn latest_hold_across_contexts_wins() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let op = OperationBuilder::new().build();
    pipeline.suspend();
    add_graph(&registry, "uploads", &[&op]);

    let soon = Utc::now() + Duration::seconds(30);
    let later = Utc::now() + Duration::seconds(90);
    pipeline.set_hold(&op.uuid(), "network", Some(soon));
    pipeline.set_hold(&op.uuid(), "quota", Some(later));
    pipeline.resume();

    assert_eq!(pipeline.hold(&op.uuid(), "network"), Some(soon));
    assert_eq!(pipeline.latest_hold(&op.uuid()), Some(later));
    assert_eq!(pipeline.holds_for_operation(&op.uuid()).len(), 2);
    assert_eq!(pipeline.holds_for_context("quota").get(&op.uuid()), Some(&later));

    // Clearing the earlier context does not release the operation.
    pipeline.set_hold(&op.uuid(), "network", None);
    assert_eq!(delegate.count(), 0);

    pipeline.set_hold(&op.uuid(), "quota", None);
    assert_eq!(delegate.count(), 1);
    assert!(pipeline.holds_for_operation(&op.uuid()).is_empty());
}

#[test]
fn expired_hold_is_picked_up_by_a_recheck() {
    let (registry, _store) = memory_registry();
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let op = OperationBuilder::new().build();
    pipeline.suspend();
    add_graph(&registry, "uploads", &[&op]);
    let until = Utc::now() + Duration::seconds(10);
    pipeline.set_hold(&op.uuid(), "backoff", Some(until));
    pipeline.resume();
    assert_eq!(delegate.count(), 0);
    assert_eq!(pipeline.next_hold_expiry(Utc::now()), Some(until));

    // Nothing happens on its own; a pass after the date dispatches.
    pipeline.recheck_at(until + Duration::milliseconds(1));
    assert_eq!(delegate.started_uuids(), vec![op.uuid()]);
    assert_eq!(pipeline.next_hold_expiry(Utc::now()), None);
}

#[test]
fn holds_on_unknown_operations_are_ignored() {
    let (registry, _store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let ghost = Operation::new();
    pipeline.set_hold(&ghost.uuid(), "network", Some(Utc::now() + Duration::seconds(5)));
    registry
        .set_hold("uploads", &ghost.uuid(), "network", Some(Utc::now()))
        .unwrap();

    assert_eq!(pipeline.latest_hold(&ghost.uuid()), None);
}

#[test]
fn holds_are_dropped_with_their_operation() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let op = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&op]);
    registry
        .set_hold("uploads", &op.uuid(), "network", Some(Utc::now() + Duration::seconds(60)))
        .unwrap();
    assert_eq!(store.holds(&op.uuid()).len(), 1);

    common::complete(&registry, "uploads", &op);
    assert!(pipeline.holds_for_context("network").is_empty());
    assert!(store.holds(&op.uuid()).is_empty());
}

#[test]
fn core_respects_future_holds_at_a_fixed_clock() {
    let now = Utc::now();
    let mut core = PipelineCore::new("uploads", PipelineAlgorithm::Flat);

    let held = OperationBuilder::new().priority(10).build();
    let free = OperationBuilder::new().build();

    let (_, _) = core.suspend(now);
    let mut commit = Commit::new(1);
    commit.add_operation(held.clone());
    commit.add_operation(free.clone());
    core.apply_commit(commit, now);
    core.set_hold(&held.uuid(), "network", Some(now + Duration::seconds(5)), now);

    let (_, step) = core.resume(now);
    let dispatched: Vec<_> = step.dispatch.iter().map(Operation::uuid).collect();
    assert_eq!(dispatched, vec![free.uuid()]);

    let step = core.recheck(now + Duration::seconds(4));
    assert!(step.dispatch.is_empty());

    let step = core.recheck(now + Duration::seconds(6));
    let dispatched: Vec<_> = step.dispatch.iter().map(Operation::uuid).collect();
    assert_eq!(dispatched, vec![held.uuid()]);
}

#[test]
fn concurrent_registry_holds_are_all_persisted() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    pipeline.suspend();
    let op = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&op]);

    let uuid = op.uuid();
    let until = Utc::now() + Duration::hours(1);
    let contexts: Vec<String> = (0..8).map(|i| format!("subsystem-{i}")).collect();
    let barrier = Barrier::new(contexts.len());

    std::thread::scope(|s| {
        for context in &contexts {
            let registry = &registry;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                registry.set_hold("uploads", &uuid, context, Some(until)).unwrap();
            });
        }
    });

    assert_eq!(pipeline.holds_for_operation(&uuid).len(), contexts.len());
    assert_eq!(store.holds(&uuid).len(), contexts.len());
    drop(registry);

    let registry = Registry::new(store.clone());
    let (restored, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    let holds = restored.holds_for_operation(&uuid);
    assert_eq!(holds.len(), contexts.len());
    assert!(contexts.iter().all(|c| holds.get(c) == Some(&until)));
}
