// src/pipeline/core.rs

//! Pure pipeline state machine.
//!
//! `PipelineCore` owns the graph arena, the hold table and the suspend /
//! concurrency state. Every mutating call returns a [`PipelineStep`] that
//! lists the operations to hand to the delegate and the events to publish.
//! It has no locks, channels or clocks: the caller passes `now` in, which
//! keeps the scheduling rules deterministic and easy to test.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::{Commit, CommitParts, validate};
use crate::errors::Result;
use crate::graph::Graph;
use crate::operation::{HoldTable, Operation};
use crate::pipeline::step::{PipelineEvent, PipelineStep};
use crate::types::{OperationStatus, PipelineAlgorithm};

/// Default number of operations handed to the delegate at once.
pub const DEFAULT_MAX_CONCURRENT_OPERATION_COUNT: usize = 8;

#[derive(Debug, Clone)]
pub struct PipelineCore {
    name: String,
    algorithm: PipelineAlgorithm,
    /// Zero means unbounded.
    max_concurrent_operation_count: usize,
    suspend_count: usize,
    /// Graph arena keyed (and therefore ordered) by snapshot.
    pub(crate) graphs: BTreeMap<u64, Graph>,
    pub(crate) holds: HoldTable,
    /// Last published value of `is_active`.
    active_flag: bool,
}

impl PipelineCore {
    pub fn new(name: impl Into<String>, algorithm: PipelineAlgorithm) -> Self {
        Self {
            name: name.into(),
            algorithm,
            max_concurrent_operation_count: DEFAULT_MAX_CONCURRENT_OPERATION_COUNT,
            suspend_count: 0,
            graphs: BTreeMap::new(),
            holds: HoldTable::new(),
            active_flag: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> PipelineAlgorithm {
        self.algorithm
    }

    pub fn max_concurrent_operation_count(&self) -> usize {
        self.max_concurrent_operation_count
    }

    pub fn suspend_count(&self) -> usize {
        self.suspend_count
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    /// Active if something is running, or if there is queued work and the
    /// pipeline is not suspended.
    pub fn is_active(&self) -> bool {
        if self.active_count() > 0 {
            return true;
        }
        !self.is_suspended() && self.graphs.values().any(Graph::has_non_terminal)
    }

    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Graph> {
        self.graphs.values()
    }

    pub fn snapshot_for_graph_index(&self, idx: usize) -> Option<u64> {
        self.graphs.keys().nth(idx).copied()
    }

    pub fn graph_index_for_snapshot(&self, snapshot: u64) -> Option<usize> {
        self.graphs.keys().position(|s| *s == snapshot)
    }

    pub fn operation(&self, uuid: &Uuid) -> Option<&Operation> {
        self.graphs.values().find_map(|g| g.find(uuid))
    }

    pub fn status(&self, uuid: &Uuid) -> Option<OperationStatus> {
        self.operation(uuid).map(Operation::status)
    }

    /// Status plus whether a hold is in effect at `now`.
    pub fn status_and_hold(&self, uuid: &Uuid, now: DateTime<Utc>) -> Option<(OperationStatus, bool)> {
        let status = self.status(uuid)?;
        Some((status, self.holds.is_held(uuid, now)))
    }

    pub fn active_count(&self) -> usize {
        self.graphs.values().map(Graph::active_count).sum()
    }

    pub fn active_operations(&self) -> Vec<Operation> {
        self.graphs
            .values()
            .flat_map(|g| g.operations().iter())
            .filter(|op| op.status() == OperationStatus::Active)
            .cloned()
            .collect()
    }

    /// Every queued operation with the index of its graph.
    pub fn operations_with_graph_index(&self) -> Vec<(usize, Operation)> {
        self.graphs
            .values()
            .enumerate()
            .flat_map(|(idx, g)| g.operations().iter().map(move |op| (idx, op.clone())))
            .collect()
    }

    pub fn graph_operations(&self) -> Vec<Vec<Operation>> {
        self.graphs
            .values()
            .map(|g| g.operations().to_vec())
            .collect()
    }

    pub fn holds(&self) -> &HoldTable {
        &self.holds
    }

    /// Earliest future hold date among queued operations.
    pub fn next_hold_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let uuids: Vec<Uuid> = self
            .graphs
            .values()
            .flat_map(|g| g.operations().iter())
            .filter(|op| op.status() == OperationStatus::Pending)
            .map(Operation::uuid)
            .collect();
        self.holds.next_expiry(uuids.iter(), now)
    }

    /// Check `commit` against the live queue before it is persisted.
    ///
    /// A modification can close a cycle with operations outside the commit,
    /// which would leave both ends waiting forever.
    pub fn check_commit(&self, commit: &Commit) -> Result<()> {
        let queued = self.graphs.values().flat_map(|g| g.operations().iter());
        validate::validate_against_queue(commit, queued)
    }

    /// Apply a committed transaction's changes for this pipeline.
    ///
    /// 1. modifications and status changes in place
    /// 2. reap completed/skipped operations and emptied graphs
    /// 3. queue inserted and added operations
    /// 4. scheduling pass
    pub fn apply_commit(&mut self, commit: Commit, now: DateTime<Utc>) -> PipelineStep {
        let CommitParts {
            snapshot,
            added,
            inserted,
            modified,
            statuses,
        } = commit.into_parts();
        debug!(
            pipeline = %self.name,
            snapshot,
            added = added.len(),
            inserted = inserted.values().map(Vec::len).sum::<usize>(),
            modified = modified.len(),
            statuses = statuses.len(),
            "applying commit"
        );

        let new_uuids: HashSet<Uuid> = inserted
            .values()
            .flatten()
            .chain(added.iter())
            .map(Operation::uuid)
            .collect();

        // 1. Modifications.
        let mut modified_ids = Vec::new();
        for op in modified {
            if let Some(uuid) = self.modify_in_place(op, &new_uuids) {
                modified_ids.push(uuid);
            }
        }
        for (uuid, status) in statuses {
            if self.apply_committed_status(&uuid, status) && !modified_ids.contains(&uuid) {
                modified_ids.push(uuid);
            }
        }

        // 2. Reap terminal operations.
        let mut removed = self.remove_completed_and_skipped();

        // 3. Inserted (into older graphs) first, then this commit's graph.
        let mut inserted_ids = Vec::new();
        for (graph_snapshot, ops) in inserted {
            for op in ops {
                if let Some(uuid) = self.enqueue(graph_snapshot, op, &new_uuids, &mut removed) {
                    inserted_ids.push(uuid);
                }
            }
        }
        let mut added_ids = Vec::new();
        for op in added {
            if let Some(uuid) = self.enqueue(snapshot, op, &new_uuids, &mut removed) {
                added_ids.push(uuid);
            }
        }
        self.relink();

        let mut step = PipelineStep::default();
        if !(added_ids.is_empty()
            && inserted_ids.is_empty()
            && modified_ids.is_empty()
            && removed.is_empty())
        {
            step.events.push(PipelineEvent::QueueChanged {
                pipeline: self.name.clone(),
                added: added_ids,
                inserted: inserted_ids,
                modified: modified_ids,
                removed,
            });
        }

        // 4. Scheduling pass.
        self.finish(step, now, true)
    }

    /// Mark an operation as already running (e.g. a background transfer
    /// that survived a restart). Consumes a concurrency slot without
    /// dispatching.
    pub fn set_status_active(&mut self, uuid: &Uuid, now: DateTime<Utc>) -> PipelineStep {
        match self.transition(uuid, OperationStatus::Active) {
            Transition::Changed => {
                info!(pipeline = %self.name, operation = %uuid, "operation marked active");
                self.finish(PipelineStep::default(), now, false)
            }
            Transition::Unchanged | Transition::Refused => PipelineStep::default(),
        }
    }

    /// Return an operation to the queue so it will be dispatched again.
    pub fn set_status_pending(&mut self, uuid: &Uuid, now: DateTime<Utc>) -> PipelineStep {
        match self.transition(uuid, OperationStatus::Pending) {
            Transition::Changed => {
                info!(pipeline = %self.name, operation = %uuid, "operation returned to pending");
                self.finish(PipelineStep::default(), now, true)
            }
            Transition::Unchanged | Transition::Refused => PipelineStep::default(),
        }
    }

    /// Install, update or clear (`None`) a hold for `context`.
    pub fn set_hold(
        &mut self,
        uuid: &Uuid,
        context: &str,
        date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PipelineStep {
        if self.operation(uuid).is_none() {
            warn!(
                pipeline = %self.name,
                operation = %uuid,
                context,
                "hold for unknown operation; ignoring"
            );
            return PipelineStep::default();
        }

        if !self.holds.set(*uuid, context, date) {
            return PipelineStep::default();
        }

        debug!(pipeline = %self.name, operation = %uuid, context, ?date, "hold updated");
        self.finish(PipelineStep::default(), now, true)
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> (usize, PipelineStep) {
        self.suspend_with_count(1, now)
    }

    /// Increment the suspend count by `increment`; zero just reports it.
    pub fn suspend_with_count(&mut self, increment: usize, now: DateTime<Utc>) -> (usize, PipelineStep) {
        if increment == 0 {
            return (self.suspend_count, PipelineStep::default());
        }

        self.suspend_count = self.suspend_count.saturating_add(increment);
        info!(pipeline = %self.name, suspend_count = self.suspend_count, "pipeline suspended");

        let step = self.suspend_count_changed();
        (self.suspend_count, self.finish(step, now, false))
    }

    /// Decrement the suspend count, never below zero.
    pub fn resume(&mut self, now: DateTime<Utc>) -> (usize, PipelineStep) {
        if self.suspend_count == 0 {
            warn!(pipeline = %self.name, "resume called on a pipeline that is not suspended");
            return (0, PipelineStep::default());
        }

        self.suspend_count -= 1;
        info!(pipeline = %self.name, suspend_count = self.suspend_count, "pipeline resumed");

        let step = self.suspend_count_changed();
        let schedule = self.suspend_count == 0;
        (self.suspend_count, self.finish(step, now, schedule))
    }

    pub fn set_max_concurrent_operation_count(&mut self, count: usize, now: DateTime<Utc>) -> PipelineStep {
        if self.max_concurrent_operation_count == count {
            return PipelineStep::default();
        }
        debug!(pipeline = %self.name, count, "max concurrent operation count changed");
        self.max_concurrent_operation_count = count;
        self.finish(PipelineStep::default(), now, true)
    }

    /// Re-run the scheduling pass (e.g. because a hold date has passed).
    pub fn recheck(&mut self, now: DateTime<Utc>) -> PipelineStep {
        self.finish(PipelineStep::default(), now, true)
    }

    /// Whether `dependency` still blocks an operation in the graph at
    /// `graph_snapshot`.
    ///
    /// Looks in the operation's own graph, then walks the `previous` chain
    /// (only populated for flat-graph pipelines). Unknown identities have
    /// already been reaped and do not block.
    pub fn dependency_blocks(&self, graph_snapshot: u64, dependency: &Uuid) -> bool {
        let mut cursor = Some(graph_snapshot);
        while let Some(snapshot) = cursor {
            let Some(graph) = self.graphs.get(&snapshot) else {
                break;
            };
            if let Some(blocks) = graph.blocks(dependency) {
                return blocks;
            }
            cursor = graph.previous();
        }
        false
    }

    /// Graph snapshot and index of the next operation to dispatch, if any.
    ///
    /// Highest priority wins; ties go to the earliest graph, then to the
    /// operation inserted first.
    pub fn next_ready_operation(&self, now: DateTime<Utc>) -> Option<(u64, usize)> {
        let mut best: Option<(u64, usize, i32)> = None;

        for (snapshot, graph) in self.eligible_graphs() {
            let found = graph.next_ready_operation(&self.holds, now, |dep| {
                self.dependency_blocks(snapshot, dep)
            });
            let Some((idx, op)) = found else {
                continue;
            };

            match best {
                Some((_, _, priority)) if priority >= op.priority() => {}
                _ => best = Some((snapshot, idx, op.priority())),
            }
        }

        best.map(|(snapshot, idx, _)| (snapshot, idx))
    }

    /// Graphs allowed to supply operations under the configured algorithm.
    fn eligible_graphs(&self) -> Vec<(u64, &Graph)> {
        match self.algorithm {
            PipelineAlgorithm::Commit => self
                .graphs
                .iter()
                .find(|(_, g)| g.has_non_terminal())
                .map(|(s, g)| vec![(*s, g)])
                .unwrap_or_default(),
            PipelineAlgorithm::Flat => self.graphs.iter().map(|(s, g)| (*s, g)).collect(),
        }
    }

    fn has_free_slot(&self) -> bool {
        self.max_concurrent_operation_count == 0
            || self.active_count() < self.max_concurrent_operation_count
    }

    /// Dispatch ready operations until none remain, the pipeline is
    /// suspended, or the concurrency limit is reached.
    fn schedule(&mut self, now: DateTime<Utc>) -> Vec<Operation> {
        let mut dispatched = Vec::new();

        if self.is_suspended() {
            debug!(pipeline = %self.name, "suspended; skipping scheduling pass");
            return dispatched;
        }

        while self.has_free_slot() {
            let Some((snapshot, idx)) = self.next_ready_operation(now) else {
                break;
            };
            let Some(op) = self
                .graphs
                .get_mut(&snapshot)
                .and_then(|g| g.operations_mut().get_mut(idx))
            else {
                break;
            };

            op.set_status(OperationStatus::Active);
            info!(
                pipeline = %self.name,
                operation = %op.uuid(),
                snapshot,
                priority = op.priority(),
                "dispatching operation"
            );
            dispatched.push(op.clone());
        }

        dispatched
    }

    /// Optionally run a scheduling pass, then publish an active-status
    /// change if there was one.
    fn finish(&mut self, mut step: PipelineStep, now: DateTime<Utc>, schedule: bool) -> PipelineStep {
        if schedule {
            let dispatched = self.schedule(now);
            step.dispatch.extend(dispatched);
        }

        let is_active = self.is_active();
        if is_active != self.active_flag {
            self.active_flag = is_active;
            debug!(pipeline = %self.name, is_active, "active status changed");
            step.events.push(PipelineEvent::ActiveStatusChanged {
                pipeline: self.name.clone(),
                is_active,
            });
        }

        step
    }

    fn suspend_count_changed(&self) -> PipelineStep {
        PipelineStep {
            dispatch: Vec::new(),
            events: vec![PipelineEvent::SuspendCountChanged {
                pipeline: self.name.clone(),
                suspend_count: self.suspend_count,
            }],
        }
    }

    fn transition(&mut self, uuid: &Uuid, next: OperationStatus) -> Transition {
        let name = &self.name;
        let Some(op) = self.graphs.values_mut().find_map(|g| g.find_mut(uuid)) else {
            warn!(pipeline = %name, operation = %uuid, ?next, "status change for unknown operation; ignoring");
            return Transition::Refused;
        };

        let current = op.status();
        if current == next {
            return Transition::Unchanged;
        }
        if current.is_terminal() || !current.can_transition_to(next) {
            warn!(
                pipeline = %name,
                operation = %uuid,
                ?current,
                ?next,
                "refusing status change outside a transaction"
            );
            return Transition::Refused;
        }

        op.set_status(next);
        Transition::Changed
    }

    fn modify_in_place(&mut self, mut op: Operation, new_uuids: &HashSet<Uuid>) -> Option<Uuid> {
        let uuid = op.uuid();
        if self.operation(&uuid).is_none() {
            debug!(
                pipeline = %self.name,
                operation = %uuid,
                "modification for operation not in any graph; ignoring"
            );
            return None;
        }

        self.prune_unknown_dependencies(&mut op, new_uuids);
        let graph = self.graphs.values_mut().find(|g| g.contains(&uuid))?;
        graph.modify(&op);
        Some(uuid)
    }

    /// Set a committed status on the live operation. Returns whether it
    /// changed.
    fn apply_committed_status(&mut self, uuid: &Uuid, status: OperationStatus) -> bool {
        let name = &self.name;
        let Some(op) = self.graphs.values_mut().find_map(|g| g.find_mut(uuid)) else {
            debug!(
                pipeline = %name,
                operation = %uuid,
                ?status,
                "status for operation not in any graph; ignoring"
            );
            return false;
        };

        let current = op.status();
        if current == status {
            return false;
        }
        if !current.can_transition_to(status) {
            warn!(
                pipeline = %name,
                operation = %uuid,
                ?current,
                ?status,
                "committed status does not follow the lifecycle; keeping current status"
            );
            return false;
        }

        op.set_status(status);
        debug!(pipeline = %name, operation = %uuid, ?status, "applied committed status");
        true
    }

    fn remove_completed_and_skipped(&mut self) -> Vec<Uuid> {
        let mut removed = Vec::new();
        for graph in self.graphs.values_mut() {
            for op in graph.remove_completed_and_skipped() {
                debug!(
                    pipeline = %self.name,
                    operation = %op.uuid(),
                    status = ?op.status(),
                    "reaped operation"
                );
                removed.push(op.uuid());
            }
        }

        for uuid in &removed {
            self.holds.remove_operation(uuid);
        }

        let before = self.graphs.len();
        self.graphs.retain(|_, g| !g.is_empty());
        if self.graphs.len() != before {
            debug!(
                pipeline = %self.name,
                removed_graphs = before - self.graphs.len(),
                "removed empty graphs"
            );
        }

        removed
    }

    /// Queue a new operation in the graph for `graph_snapshot`.
    ///
    /// Operations that arrive already completed or skipped are recorded as
    /// removed and never queued.
    fn enqueue(
        &mut self,
        graph_snapshot: u64,
        mut op: Operation,
        new_uuids: &HashSet<Uuid>,
        removed: &mut Vec<Uuid>,
    ) -> Option<Uuid> {
        let uuid = op.uuid();

        if self.operation(&uuid).is_some() {
            warn!(pipeline = %self.name, operation = %uuid, "operation already queued; ignoring duplicate");
            return None;
        }

        op.apply_pending_status();
        if op.is_terminal() {
            debug!(pipeline = %self.name, operation = %uuid, "operation finished within its own commit");
            removed.push(uuid);
            return None;
        }

        self.prune_unknown_dependencies(&mut op, new_uuids);
        self.graphs
            .entry(graph_snapshot)
            .or_insert_with(|| Graph::new(graph_snapshot, Vec::new()))
            .push(op);
        Some(uuid)
    }

    /// Drop dependency references that name no queued operation.
    fn prune_unknown_dependencies(&self, op: &mut Operation, new_uuids: &HashSet<Uuid>) {
        let dropped = op.retain_dependencies(|dep| {
            new_uuids.contains(dep) || self.operation(dep).is_some()
        });
        for dep in dropped {
            debug!(
                pipeline = %self.name,
                operation = %op.uuid(),
                dependency = %dep,
                "dropping reference to unknown dependency"
            );
        }
    }

    /// Recompute `previous` links after graphs were added or removed.
    pub(crate) fn relink(&mut self) {
        let link = self.algorithm == PipelineAlgorithm::Flat;
        let mut previous = None;
        for (snapshot, graph) in self.graphs.iter_mut() {
            graph.set_previous(if link { previous } else { None });
            previous = Some(*snapshot);
        }
    }

    pub(crate) fn refresh_active_flag(&mut self) {
        self.active_flag = self.is_active();
    }

    pub(crate) fn set_max_concurrent_silently(&mut self, count: usize) {
        self.max_concurrent_operation_count = count;
    }
}

enum Transition {
    Changed,
    Unchanged,
    Refused,
}
