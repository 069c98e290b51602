mod common;

use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use cloudpipe::errors::CloudpipeError;
use cloudpipe::pipeline::{Pipeline, PipelineOptions};
use cloudpipe::registry::Registry;
use cloudpipe::store::{PersistedOperation, SqliteStore};
use cloudpipe::types::PipelineAlgorithm;
use cloudpipe::{Operation, OperationStatus};
use tempfile::tempdir;

use common::{OperationBuilder, RecordingDelegate, add_graph, init_tracing, memory_registry, options, register};

fn uuids(graphs: &[Vec<Operation>]) -> Vec<Vec<uuid::Uuid>> {
    graphs
        .iter()
        .map(|g| g.iter().map(Operation::uuid).collect())
        .collect()
}

fn renamed(previous: &str, algorithm: PipelineAlgorithm) -> PipelineOptions {
    PipelineOptions {
        previous_names: BTreeSet::from([previous.to_string()]),
        ..options(algorithm, 8)
    }
}

#[test]
fn restart_restores_the_same_queue_without_dispatching() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Flat, 8));

    pipeline.suspend();
    let a = OperationBuilder::new().priority(3).payload(b"a").build();
    let b = OperationBuilder::new().after(&a).build();
    let c = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&a, &b]);
    add_graph(&registry, "uploads", &[&c]);
    let before = pipeline.graph_operations();
    drop(registry);

    let registry = Registry::new(store.clone());
    let (restored, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Flat, 8));

    assert_eq!(uuids(&restored.graph_operations()), uuids(&before));
    assert_eq!(restored.graph_operations(), before);
    assert_eq!(delegate.count(), 0);
    assert!(restored.active_operations().is_empty());

    restored.recheck();
    let mut started = delegate.started_uuids();
    started.sort();
    let mut expected = vec![a.uuid(), c.uuid()];
    expected.sort();
    assert_eq!(started, expected);
}

#[test]
fn restore_is_idempotent() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    pipeline.suspend();
    add_graph(&registry, "uploads", &[&Operation::new(), &Operation::new()]);
    drop(registry);

    let registry = Registry::new(store.clone());
    let (restored, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    let first = restored.persisted_operations();

    let again = restored.restore(first.clone(), Some(PipelineAlgorithm::Commit)).unwrap();
    assert_eq!(again, 2);
    assert_eq!(restored.persisted_operations(), first);
}

#[test]
fn restored_active_operation_stays_active_until_reconciled() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    pipeline.suspend();
    let op = OperationBuilder::new().build();
    add_graph(&registry, "uploads", &[&op]);
    let mut tx = registry.begin();
    tx.set_pending_status("uploads", &op, OperationStatus::Active);
    registry.commit(tx).unwrap();
    drop(registry);

    let registry = Registry::new(store.clone());
    let (restored, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    assert_eq!(restored.status(&op.uuid()), Some(OperationStatus::Active));
    assert!(restored.is_active());

    restored.recheck();
    assert_eq!(delegate.count(), 0);

    // The executor did not survive the restart: retry it.
    restored.set_status_pending(&op.uuid());
    assert_eq!(delegate.started_uuids(), vec![op.uuid()]);
}

#[test]
fn duplicate_rows_are_restored_once() {
    init_tracing();
    let pipeline = Pipeline::with_options(
        "uploads",
        options(PipelineAlgorithm::Commit, 8),
        RecordingDelegate::new(),
    );

    let live = Operation::new();
    let records = vec![
        PersistedOperation::new(live.clone()),
        PersistedOperation::new(live.clone()),
    ];
    assert_eq!(pipeline.restore(records, None).unwrap(), 1);
    assert_eq!(pipeline.graph_count(), 1);
    assert_eq!(pipeline.status(&live.uuid()), Some(OperationStatus::Pending));
}

#[test]
fn changed_algorithm_requires_migration() {
    let (registry, store) = memory_registry();
    register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    add_graph(&registry, "uploads", &[&Operation::new()]);
    drop(registry);

    let registry = Registry::new(store.clone());
    let err = registry
        .register(Pipeline::with_options(
            "uploads",
            options(PipelineAlgorithm::Flat, 8),
            RecordingDelegate::new(),
        ))
        .unwrap_err();
    assert!(matches!(
        err,
        CloudpipeError::AlgorithmChanged {
            previous: PipelineAlgorithm::Commit,
            current: PipelineAlgorithm::Flat,
            ..
        }
    ));
    assert!(registry.pipeline("uploads").is_none());

    let migrating = PipelineOptions {
        migrate_algorithm: true,
        ..options(PipelineAlgorithm::Flat, 8)
    };
    let (migrated, _delegate) = register(&registry, "uploads", migrating);
    assert_eq!(migrated.graph_count(), 1);
    drop(registry);

    // The new algorithm was recorded; no migration flag needed any more.
    let registry = Registry::new(store.clone());
    let (again, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Flat, 8));
    assert_eq!(again.algorithm(), PipelineAlgorithm::Flat);
}

#[test]
fn rejected_registration_leaves_the_store_untouched() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    pipeline.suspend();
    let op = Operation::new();
    add_graph(&registry, "uploads", &[&op]);
    drop(registry);

    let registry = Registry::new(store.clone());
    let err = registry
        .register(Pipeline::with_options(
            "outbox",
            renamed("uploads", PipelineAlgorithm::Flat),
            RecordingDelegate::new(),
        ))
        .unwrap_err();
    assert!(matches!(err, CloudpipeError::AlgorithmChanged { .. }));
    assert_eq!(store.pipeline_names(), vec!["uploads".to_string()]);
    assert!(registry.pipeline_names().is_empty());

    let (uploads, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    assert_eq!(uploads.status(&op.uuid()), Some(OperationStatus::Pending));
}

#[test]
fn renamed_pipeline_keeps_its_operations() {
    let (registry, store) = memory_registry();
    let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));
    pipeline.suspend();
    let op = Operation::new();
    add_graph(&registry, "uploads", &[&op]);
    drop(registry);

    let registry = Registry::new(store.clone());
    let (outbox, _delegate) = register(&registry, "outbox", renamed("uploads", PipelineAlgorithm::Commit));

    assert_eq!(outbox.status(&op.uuid()), Some(OperationStatus::Pending));
    assert_eq!(store.pipeline_names(), vec!["outbox".to_string()]);
    assert_eq!(registry.pipeline_names(), vec!["outbox".to_string()]);
}

#[test]
fn duplicate_names_are_rejected() {
    let (registry, _store) = memory_registry();
    register(&registry, "uploads", options(PipelineAlgorithm::Commit, 8));

    let same = Pipeline::new("uploads", RecordingDelegate::new());
    assert!(matches!(
        registry.register(same).unwrap_err(),
        CloudpipeError::DuplicatePipeline(name) if name == "uploads"
    ));

    let alias = Pipeline::with_options(
        "outbox",
        renamed("uploads", PipelineAlgorithm::Commit),
        RecordingDelegate::new(),
    );
    assert!(matches!(
        registry.register(alias).unwrap_err(),
        CloudpipeError::DuplicatePipeline(_)
    ));
}

#[test]
fn sqlite_store_survives_a_restart() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = dir.path().join("state").join("cloudpipe.db");
    let until = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();

    let first = OperationBuilder::new().priority(7).payload(b"hello").build();
    let second = OperationBuilder::new().after(&first).build();
    let gone = OperationBuilder::new().build();
    let before;
    {
        let registry = Registry::new(SqliteStore::open(&db).unwrap());
        let (pipeline, _delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Flat, 8));
        pipeline.suspend();
        add_graph(&registry, "uploads", &[&first, &gone]);
        add_graph(&registry, "uploads", &[&second]);
        registry
            .set_hold("uploads", &second.uuid(), "network", Some(until))
            .unwrap();
        common::skip(&registry, "uploads", &gone);
        before = pipeline.graph_operations();
    }

    let registry = Registry::new(SqliteStore::open(&db).unwrap());
    let (pipeline, delegate) = register(&registry, "uploads", options(PipelineAlgorithm::Flat, 8));

    assert_eq!(uuids(&pipeline.graph_operations()), uuids(&before));
    let restored = pipeline.operation(&first.uuid()).unwrap();
    assert_eq!(restored.priority(), 7);
    assert_eq!(restored.payload(), b"hello");
    assert!(restored.rowid().is_some());
    assert_eq!(pipeline.operation(&gone.uuid()), None);
    assert!(
        pipeline
            .operation(&second.uuid())
            .unwrap()
            .dependencies()
            .contains(&first.uuid())
    );
    assert_eq!(pipeline.hold(&second.uuid(), "network"), Some(until));
    assert_eq!(delegate.count(), 0);

    pipeline.recheck();
    assert_eq!(delegate.started_uuids(), vec![first.uuid()]);

    // Snapshots keep counting from where the last run stopped.
    let next = add_graph(&registry, "uploads", &[&Operation::new()]);
    assert_eq!(next, 4);
}
