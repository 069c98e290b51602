// src/registry.rs

//! Coordinates pipelines with the operation store.
//!
//! A commit goes through the registry in four steps:
//!
//! 1. the [`Transaction`] is validated and stamped with the next snapshot,
//!    then checked against each pipeline's live queue
//! 2. its row changes are written to the store, atomically
//! 3. every affected pipeline applies its [`crate::commit::Commit`]
//! 4. dispatches and events run, after every lock has been released
//!
//! Steps 1-3 happen under the store lock, so commits are applied in the
//! same order they were written.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::Transaction;
use crate::config::model::ConfigFile;
use crate::errors::{CloudpipeError, Result};
use crate::pipeline::restore::check_algorithm;
use crate::pipeline::{Pipeline, PipelineDelegate};
use crate::store::{OperationStore, PipelineChangeset};

#[derive(Debug, Clone)]
struct Registered {
    rowid: i64,
    pipeline: Pipeline,
}

pub struct Registry {
    store: Mutex<Box<dyn OperationStore>>,
    pipelines: RwLock<BTreeMap<String, Registered>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pipelines", &self.pipeline_names())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: impl OperationStore + 'static) -> Self {
        Self::with_store(Box::new(store))
    }

    pub fn with_store(store: Box<dyn OperationStore>) -> Self {
        Self {
            store: Mutex::new(store),
            pipelines: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register `pipeline` and restore its stored operations.
    ///
    /// Fails if the name (or one of its previous names) is already taken,
    /// or if the stored algorithm differs and migration was not requested.
    /// Restored operations are not dispatched; reconcile Active ones and
    /// call [`Pipeline::recheck`].
    pub fn register(&self, pipeline: Pipeline) -> Result<Pipeline> {
        let name = pipeline.name().to_string();
        {
            let pipelines = self.read_pipelines();
            for (existing, registered) in pipelines.iter() {
                let taken = *existing == name
                    || pipeline.previous_names().contains(existing)
                    || registered.pipeline.previous_names().contains(&name);
                if taken {
                    return Err(CloudpipeError::DuplicatePipeline(name));
                }
            }
        }

        let mut store = self.lock_store();
        if let Some(stored) = store.lookup_pipeline(&name, pipeline.previous_names())? {
            check_algorithm(
                &name,
                stored.previous_algorithm,
                pipeline.algorithm(),
                pipeline.migrate_algorithm(),
            )?;
        }
        let record = store.register_pipeline(&name, pipeline.previous_names(), pipeline.algorithm())?;

        let records = store.load_operations(record.rowid)?;
        let restored = pipeline.restore(records, record.previous_algorithm)?;

        if record
            .previous_algorithm
            .is_some_and(|previous| previous != pipeline.algorithm())
        {
            store.set_pipeline_algorithm(record.rowid, pipeline.algorithm())?;
        }
        drop(store);

        info!(
            pipeline = %name,
            rowid = record.rowid,
            algorithm = %pipeline.algorithm(),
            restored,
            "registered pipeline"
        );

        self.write_pipelines().insert(
            name,
            Registered {
                rowid: record.rowid,
                pipeline: pipeline.clone(),
            },
        );
        Ok(pipeline)
    }

    /// Build and register every pipeline declared in `cfg`.
    pub fn register_configured(
        &self,
        cfg: &ConfigFile,
        delegate: Arc<dyn PipelineDelegate>,
    ) -> Result<Vec<Pipeline>> {
        cfg.pipeline
            .iter()
            .map(|(name, pipeline_cfg)| {
                let options = pipeline_cfg.options(&cfg.default);
                self.register(Pipeline::with_options(name.clone(), options, delegate.clone()))
            })
            .collect()
    }

    pub fn pipeline(&self, name: &str) -> Option<Pipeline> {
        self.read_pipelines().get(name).map(|r| r.pipeline.clone())
    }

    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.read_pipelines()
            .values()
            .map(|r| r.pipeline.clone())
            .collect()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.read_pipelines().keys().cloned().collect()
    }

    /// Start a transaction. Nothing is visible until [`Registry::commit`].
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Persist and apply a transaction. Returns the snapshot it was given.
    ///
    /// An empty transaction writes nothing and returns the latest snapshot.
    pub fn commit(&self, tx: Transaction) -> Result<u64> {
        let mut store = self.lock_store();

        if tx.is_empty() {
            return store.last_snapshot();
        }

        let snapshot = store.next_snapshot()?;
        let commits = tx.finish(snapshot)?;

        let mut targets = Vec::with_capacity(commits.len());
        let mut changesets = Vec::with_capacity(commits.len());
        {
            let pipelines = self.read_pipelines();
            for (name, commit) in commits {
                let registered = pipelines
                    .get(&name)
                    .ok_or_else(|| CloudpipeError::PipelineNotFound(name.clone()))?;
                changesets.push(PipelineChangeset {
                    pipeline_rowid: registered.rowid,
                    changeset: commit.changeset(),
                });
                targets.push((registered.pipeline.clone(), commit));
            }
        }
        for (pipeline, commit) in &targets {
            pipeline.check_commit(commit)?;
        }

        let rowids = store.apply_changesets(snapshot, &changesets)?;

        let now = Utc::now();
        let steps: Vec<_> = targets
            .into_iter()
            .map(|(pipeline, mut commit)| {
                commit.assign_rowids(&rowids);
                let step = pipeline.apply_commit_deferred(commit, now);
                (pipeline, step)
            })
            .collect();
        drop(store);

        debug!(snapshot, pipelines = steps.len(), "commit applied");
        for (pipeline, step) in steps {
            pipeline.run_step(step);
        }
        Ok(snapshot)
    }

    /// Set or clear a hold and persist it with the operation.
    ///
    /// The store lock is held from reading the current holds until the
    /// in-memory table is updated, so holds set concurrently under
    /// different contexts are all kept.
    pub fn set_hold(
        &self,
        pipeline: &str,
        uuid: &Uuid,
        context: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let pipeline = self
            .pipeline(pipeline)
            .ok_or_else(|| CloudpipeError::PipelineNotFound(pipeline.to_string()))?;

        let mut store = self.lock_store();
        if pipeline.operation(uuid).is_none() {
            warn!(
                pipeline = %pipeline.name(),
                operation = %uuid,
                context,
                "hold for unknown operation; ignoring"
            );
            return Ok(());
        }

        let mut holds: BTreeMap<String, DateTime<Utc>> =
            pipeline.holds_for_operation(uuid).into_iter().collect();
        match date {
            Some(date) => {
                holds.insert(context.to_string(), date);
            }
            None => {
                holds.remove(context);
            }
        }
        store.save_holds(*uuid, &holds)?;

        let step = pipeline.set_hold_deferred(uuid, context, date, Utc::now());
        drop(store);

        pipeline.run_step(step);
        Ok(())
    }

    /// Run a scheduling pass on every pipeline.
    pub fn recheck_all(&self) {
        for pipeline in self.pipelines() {
            pipeline.recheck();
        }
    }

    /// Earliest future hold date across every pipeline.
    pub fn next_hold_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.pipelines()
            .iter()
            .filter_map(|p| p.next_hold_expiry(now))
            .min()
    }

    fn lock_store(&self) -> MutexGuard<'_, Box<dyn OperationStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_pipelines(&self) -> RwLockReadGuard<'_, BTreeMap<String, Registered>> {
        self.pipelines.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pipelines(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Registered>> {
        self.pipelines.write().unwrap_or_else(PoisonError::into_inner)
    }
}
