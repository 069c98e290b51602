// src/graph/mod.rs

//! A graph is the batch of operations produced by a single commit.
//!
//! Graphs live in an arena owned by the pipeline (`BTreeMap<snapshot, Graph>`).
//! Under the flat-graph algorithm each graph also records the snapshot of the
//! graph before it, so dependency lookups can walk backwards through earlier
//! commits without holding references into the arena.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::operation::{HoldTable, Operation};
use crate::types::OperationStatus;

#[derive(Debug, Clone)]
pub struct Graph {
    snapshot: u64,
    /// Insertion order matters: it is the final tie-break during selection.
    operations: Vec<Operation>,
    /// Snapshot key of the preceding graph (flat-graph pipelines only).
    previous: Option<u64>,
}

impl Graph {
    pub fn new(snapshot: u64, operations: Vec<Operation>) -> Self {
        let mut graph = Self {
            snapshot,
            operations: Vec::with_capacity(operations.len()),
            previous: None,
        };
        for op in operations {
            graph.push(op);
        }
        graph
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn previous(&self) -> Option<u64> {
        self.previous
    }

    pub(crate) fn set_previous(&mut self, previous: Option<u64>) {
        self.previous = previous;
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn find(&self, uuid: &Uuid) -> Option<&Operation> {
        self.operations.iter().find(|op| op.uuid() == *uuid)
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [Operation] {
        &mut self.operations
    }

    pub(crate) fn find_mut(&mut self, uuid: &Uuid) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.uuid() == *uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.find(uuid).is_some()
    }

    /// Append an operation, stamping it with this graph's snapshot.
    pub(crate) fn push(&mut self, mut op: Operation) {
        op.set_snapshot(self.snapshot);
        self.operations.push(op);
    }

    /// Apply a modification in place, matching by identity.
    ///
    /// Returns `false` if the operation is not part of this graph.
    pub(crate) fn modify(&mut self, modified: &Operation) -> bool {
        let Some(op) = self.find_mut(&modified.uuid()) else {
            return false;
        };
        op.merge_modification(modified);
        debug!(operation = %op.uuid(), snapshot = op.snapshot(), "applied modification");
        true
    }

    /// Remove every completed/skipped operation, preserving the order of the
    /// rest. Returns the removed operations.
    pub(crate) fn remove_completed_and_skipped(&mut self) -> Vec<Operation> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.operations)
            .into_iter()
            .partition(Operation::is_terminal);
        self.operations = kept;
        removed
    }

    /// Whether any operation still needs to run (or is running).
    pub fn has_non_terminal(&self) -> bool {
        self.operations.iter().any(|op| !op.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status() == OperationStatus::Active)
            .count()
    }

    /// Whether `uuid` is an operation of this graph that still blocks its
    /// dependents.
    ///
    /// `None` if the graph does not know the operation.
    pub fn blocks(&self, uuid: &Uuid) -> Option<bool> {
        self.find(uuid).map(|op| !op.is_terminal())
    }

    /// The highest-priority ready operation of this graph, with its index.
    ///
    /// `dependency_blocks` answers whether a dependency identity still blocks
    /// (it is given the pipeline-wide view, including earlier graphs).
    /// Ties on priority go to the operation inserted first.
    pub fn next_ready_operation<F>(
        &self,
        holds: &HoldTable,
        now: DateTime<Utc>,
        dependency_blocks: F,
    ) -> Option<(usize, &Operation)>
    where
        F: Fn(&Uuid) -> bool,
    {
        let mut best: Option<(usize, &Operation)> = None;

        for (idx, op) in self.operations.iter().enumerate() {
            if op.status() != OperationStatus::Pending {
                continue;
            }
            if holds.is_held(&op.uuid(), now) {
                continue;
            }
            if op.dependencies().iter().any(&dependency_blocks) {
                continue;
            }

            match best {
                Some((_, current)) if current.priority() >= op.priority() => {}
                _ => best = Some((idx, op)),
            }
        }

        best
    }
}
