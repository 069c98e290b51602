// src/pipeline/mod.rs

//! Pipelines: ordered graphs of operations plus the policy that decides
//! which operation runs next.
//!
//! The scheduling rules live in [`PipelineCore`], a plain synchronous state
//! machine. [`Pipeline`] is the shared handle around it:
//!
//! - a single `Mutex` serialises commits, executor callbacks and reads
//! - every change produces a [`PipelineStep`]; its dispatches and events are
//!   carried out after the lock is released
//! - events go out on a `tokio::sync::broadcast` channel
//!
//! Restoring from persisted rows is in [`restore`].

pub mod core;
pub mod delegate;
pub mod restore;
pub mod step;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::commit::Commit;
use crate::errors::Result;
use crate::operation::Operation;
use crate::store::PersistedOperation;
use crate::types::{OperationStatus, PipelineAlgorithm};

pub use self::core::{DEFAULT_MAX_CONCURRENT_OPERATION_COUNT, PipelineCore};
pub use delegate::{ChannelDelegate, PipelineDelegate, StartedOperation};
pub use step::{PipelineEvent, PipelineStep};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Construction options for a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub algorithm: PipelineAlgorithm,
    /// Zero means unbounded.
    pub max_concurrent_operation_count: usize,
    /// Names this pipeline was registered under in earlier releases.
    pub previous_names: BTreeSet<String>,
    /// Accept a stored algorithm that differs from `algorithm`.
    pub migrate_algorithm: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            algorithm: PipelineAlgorithm::default(),
            max_concurrent_operation_count: DEFAULT_MAX_CONCURRENT_OPERATION_COUNT,
            previous_names: BTreeSet::new(),
            migrate_algorithm: false,
        }
    }
}

/// Shared, cloneable handle to one pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    previous_names: BTreeSet<String>,
    migrate_algorithm: bool,
    core: Mutex<PipelineCore>,
    delegate: Arc<dyn PipelineDelegate>,
    events: broadcast::Sender<PipelineEvent>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("previous_names", &self.inner.previous_names)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Commit-graph pipeline with default options.
    pub fn new(name: impl Into<String>, delegate: Arc<dyn PipelineDelegate>) -> Self {
        Self::with_options(name, PipelineOptions::default(), delegate)
    }

    pub fn with_options(
        name: impl Into<String>,
        options: PipelineOptions,
        delegate: Arc<dyn PipelineDelegate>,
    ) -> Self {
        let name = name.into();
        let mut core = PipelineCore::new(name.clone(), options.algorithm);
        core.set_max_concurrent_silently(options.max_concurrent_operation_count);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                name,
                previous_names: options.previous_names,
                migrate_algorithm: options.migrate_algorithm,
                core: Mutex::new(core),
                delegate,
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn algorithm(&self) -> PipelineAlgorithm {
        self.lock().algorithm()
    }

    pub fn previous_names(&self) -> &BTreeSet<String> {
        &self.inner.previous_names
    }

    pub fn migrate_algorithm(&self) -> bool {
        self.inner.migrate_algorithm
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Commits
    // ---------------------------------------------------------------------

    /// Apply a committed change set and dispatch whatever became ready.
    pub fn apply_commit(&self, commit: Commit) {
        let step = self.apply_commit_deferred(commit, Utc::now());
        self.run_step(step);
    }

    /// Reject a commit that would leave a dependency cycle in the queue.
    pub(crate) fn check_commit(&self, commit: &Commit) -> Result<()> {
        self.lock().check_commit(commit)
    }

    /// Apply a commit under the lock but leave dispatch to the caller.
    pub(crate) fn apply_commit_deferred(&self, commit: Commit, now: DateTime<Utc>) -> PipelineStep {
        self.lock().apply_commit(commit, now)
    }

    /// Publish events, then hand dispatched operations to the delegate.
    ///
    /// Never called with the pipeline lock held.
    pub(crate) fn run_step(&self, step: PipelineStep) {
        for event in step.events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
        for op in step.dispatch {
            self.inner.delegate.start_operation(self, op);
        }
    }

    // ---------------------------------------------------------------------
    // Executor-facing mutations
    // ---------------------------------------------------------------------

    /// Mark an operation as already in flight without dispatching it.
    pub fn set_status_active(&self, uuid: &Uuid) {
        self.mutate(|core, now| core.set_status_active(uuid, now));
    }

    /// Return an operation to the queue (retry, cancellation).
    pub fn set_status_pending(&self, uuid: &Uuid) {
        self.mutate(|core, now| core.set_status_pending(uuid, now));
    }

    /// Install, update or clear (`None`) a hold for `context`.
    ///
    /// In-memory only; [`crate::registry::Registry::set_hold`] also persists
    /// the hold.
    pub fn set_hold(&self, uuid: &Uuid, context: &str, date: Option<DateTime<Utc>>) {
        self.mutate(|core, now| core.set_hold(uuid, context, date, now));
    }

    pub(crate) fn set_hold_deferred(
        &self,
        uuid: &Uuid,
        context: &str,
        date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PipelineStep {
        self.lock().set_hold(uuid, context, date, now)
    }

    /// Increment the suspend count; returns the new count.
    pub fn suspend(&self) -> usize {
        self.mutate_with(|core, now| core.suspend(now))
    }

    pub fn suspend_with_count(&self, increment: usize) -> usize {
        self.mutate_with(|core, now| core.suspend_with_count(increment, now))
    }

    /// Decrement the suspend count (never below zero); returns the new count.
    pub fn resume(&self) -> usize {
        self.mutate_with(|core, now| core.resume(now))
    }

    pub fn set_max_concurrent_operation_count(&self, count: usize) {
        self.mutate(|core, now| core.set_max_concurrent_operation_count(count, now));
    }

    /// Run a scheduling pass now.
    pub fn recheck(&self) {
        self.recheck_at(Utc::now());
    }

    /// Run a scheduling pass as if the current time were `now`.
    pub fn recheck_at(&self, now: DateTime<Utc>) {
        let step = self.lock().recheck(now);
        self.run_step(step);
    }

    // ---------------------------------------------------------------------
    // Queries (owned copies only)
    // ---------------------------------------------------------------------

    pub fn status(&self, uuid: &Uuid) -> Option<OperationStatus> {
        self.lock().status(uuid)
    }

    /// Status plus whether a hold is in effect right now.
    pub fn status_and_hold(&self, uuid: &Uuid) -> Option<(OperationStatus, bool)> {
        self.lock().status_and_hold(uuid, Utc::now())
    }

    pub fn hold(&self, uuid: &Uuid, context: &str) -> Option<DateTime<Utc>> {
        self.lock().holds().get(uuid, context)
    }

    /// The effective hold date: the latest across contexts.
    pub fn latest_hold(&self, uuid: &Uuid) -> Option<DateTime<Utc>> {
        self.lock().holds().latest(uuid)
    }

    pub fn holds_for_operation(&self, uuid: &Uuid) -> HashMap<String, DateTime<Utc>> {
        self.lock().holds().for_operation(uuid)
    }

    pub fn holds_for_context(&self, context: &str) -> HashMap<Uuid, DateTime<Utc>> {
        self.lock().holds().for_context(context)
    }

    /// Earliest hold date still in the future among pending operations.
    pub fn next_hold_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lock().next_hold_expiry(now)
    }

    pub fn suspend_count(&self) -> usize {
        self.lock().suspend_count()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().is_suspended()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    pub fn max_concurrent_operation_count(&self) -> usize {
        self.lock().max_concurrent_operation_count()
    }

    pub fn operation(&self, uuid: &Uuid) -> Option<Operation> {
        self.lock().operation(uuid).cloned()
    }

    /// Copies of the requested operations; unknown identities are skipped.
    pub fn operations(&self, uuids: &[Uuid]) -> Vec<Operation> {
        let core = self.lock();
        uuids
            .iter()
            .filter_map(|uuid| core.operation(uuid).cloned())
            .collect()
    }

    pub fn active_operations(&self) -> Vec<Operation> {
        self.lock().active_operations()
    }

    pub fn operations_with_graph_index(&self) -> Vec<(usize, Operation)> {
        self.lock().operations_with_graph_index()
    }

    pub fn graph_count(&self) -> usize {
        self.lock().graph_count()
    }

    pub fn snapshot_for_graph_index(&self, idx: usize) -> Option<u64> {
        self.lock().snapshot_for_graph_index(idx)
    }

    pub fn graph_index_for_snapshot(&self, snapshot: u64) -> Option<usize> {
        self.lock().graph_index_for_snapshot(snapshot)
    }

    /// Operations grouped per graph, in snapshot order.
    pub fn graph_operations(&self) -> Vec<Vec<Operation>> {
        self.lock().graph_operations()
    }

    /// The queue as it would be persisted: every operation with its holds.
    pub fn persisted_operations(&self) -> Vec<PersistedOperation> {
        self.lock().persisted_operations()
    }

    /// Rebuild the queue from stored rows. Nothing is dispatched.
    ///
    /// `stored_algorithm` is the algorithm recorded by an earlier run (if
    /// any); a mismatch is only accepted with `migrate_algorithm`.
    pub fn restore(
        &self,
        records: Vec<PersistedOperation>,
        stored_algorithm: Option<PipelineAlgorithm>,
    ) -> Result<usize> {
        let mut core = self.lock();
        restore::check_algorithm(
            core.name(),
            stored_algorithm,
            core.algorithm(),
            self.inner.migrate_algorithm,
        )?;
        Ok(core.restore(records))
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut PipelineCore, DateTime<Utc>) -> PipelineStep,
    {
        let step = f(&mut self.lock(), Utc::now());
        self.run_step(step);
    }

    fn mutate_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PipelineCore, DateTime<Utc>) -> (R, PipelineStep),
    {
        let (value, step) = f(&mut self.lock(), Utc::now());
        self.run_step(step);
        value
    }

    fn lock(&self) -> MutexGuard<'_, PipelineCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
