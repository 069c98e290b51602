// src/commit/mod.rs

//! Transactional staging of operation changes.
//!
//! A [`Transaction`] collects, per pipeline, everything a single storage
//! commit does to the operation queue:
//!
//! - operations *added* (they form the graph for this commit's snapshot)
//! - operations *inserted* into the graph of an earlier snapshot
//! - operations *modified* (priority, dependencies, payload)
//! - status changes (complete, skip, retry), keyed by identity
//!
//! A status change carries nothing but the status: it is applied to the
//! live operation when the pipeline applies the [`Commit`], so a stale copy
//! held by an executor cannot roll back newer modifications. Dropping a
//! transaction discards everything it staged.
//!
//! - [`changeset`] turns a commit into the row writes the store performs.
//! - [`validate`] rejects commits whose new operations form a cycle.

pub mod changeset;
pub mod validate;

use std::collections::{BTreeMap, HashMap};

use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;
use crate::operation::Operation;
use crate::types::OperationStatus;

pub use changeset::{RowChangeset, RowWrite};

/// The changes one commit makes to one pipeline.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    snapshot: u64,
    added: Vec<Operation>,
    inserted: BTreeMap<u64, Vec<Operation>>,
    modified: Vec<Operation>,
    statuses: BTreeMap<Uuid, OperationStatus>,
}

impl Commit {
    pub fn new(snapshot: u64) -> Self {
        Self {
            snapshot,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn added(&self) -> &[Operation] {
        &self.added
    }

    pub fn inserted(&self) -> &BTreeMap<u64, Vec<Operation>> {
        &self.inserted
    }

    pub fn modified(&self) -> &[Operation] {
        &self.modified
    }

    /// Status changes staged for operations already in the queue.
    pub fn statuses(&self) -> &BTreeMap<Uuid, OperationStatus> {
        &self.statuses
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.inserted.is_empty()
            && self.modified.is_empty()
            && self.statuses.is_empty()
    }

    /// Queue a new operation in this commit's own graph.
    pub fn add_operation(&mut self, mut op: Operation) {
        op.set_snapshot(self.snapshot);
        op.set_status(OperationStatus::Pending);
        self.take_staged_status(&mut op);
        debug!(operation = %op.uuid(), snapshot = self.snapshot, "staged added operation");
        self.added.push(op);
    }

    /// Queue a new operation in the graph of an earlier commit.
    pub fn insert_operation(&mut self, mut op: Operation, graph_snapshot: u64) {
        op.set_snapshot(graph_snapshot);
        op.set_status(OperationStatus::Pending);
        self.take_staged_status(&mut op);
        debug!(
            operation = %op.uuid(),
            graph_snapshot,
            "staged inserted operation"
        );
        self.inserted.entry(graph_snapshot).or_default().push(op);
    }

    /// Stage a modified copy of a queued operation.
    ///
    /// Only priority, dependencies and payload are taken from `op`; its
    /// status is ignored. If the operation was added or inserted earlier in
    /// this same commit, the staged copy is replaced and keeps any status
    /// staged for it.
    pub fn modify_operation(&mut self, mut op: Operation) {
        op.clear_pending_status();

        if let Some(staged) = self.staged_new_mut(&op.uuid()) {
            let snapshot = staged.snapshot();
            let pending = staged.pending_status();
            *staged = op;
            staged.set_snapshot(snapshot);
            staged.set_status(OperationStatus::Pending);
            if let Some(status) = pending {
                staged.stage_status(status);
            }
            return;
        }

        match self.modified.iter_mut().find(|m| m.uuid() == op.uuid()) {
            Some(existing) => *existing = op,
            None => self.modified.push(op),
        }
    }

    pub fn complete_operation(&mut self, op: &Operation) {
        self.set_pending_status(op, OperationStatus::Completed);
    }

    pub fn skip_operation(&mut self, op: &Operation) {
        self.set_pending_status(op, OperationStatus::Skipped);
    }

    /// Stage `status` for `op`; it becomes visible when the commit applies.
    ///
    /// Only the identity of `op` is used.
    pub fn set_pending_status(&mut self, op: &Operation, status: OperationStatus) {
        let uuid = op.uuid();

        match self.staged_new_mut(&uuid) {
            Some(staged) => staged.stage_status(status),
            None => {
                self.statuses.insert(uuid, status);
            }
        }

        debug!(operation = %uuid, ?status, "staged pending status");
    }

    /// Check the commit before it is handed to the store.
    pub fn validate(&self) -> Result<()> {
        validate::validate_commit(self)
    }

    /// Row writes this commit requires.
    pub fn changeset(&self) -> RowChangeset {
        RowChangeset::from_commit(self)
    }

    /// Record row handles handed out by the store for inserted rows.
    pub fn assign_rowids(&mut self, rowids: &HashMap<Uuid, i64>) {
        let ops = self
            .added
            .iter_mut()
            .chain(self.inserted.values_mut().flatten())
            .chain(self.modified.iter_mut());
        for op in ops {
            if let Some(rowid) = rowids.get(&op.uuid()) {
                op.set_rowid(*rowid);
            }
        }
    }

    /// All operations that enter the queue with this commit, in declaration
    /// order (inserted graphs first, by snapshot, then the added graph).
    pub(crate) fn new_operations(&self) -> impl Iterator<Item = &Operation> {
        self.inserted.values().flatten().chain(self.added.iter())
    }

    /// Stamp the snapshot assigned at commit time onto the commit and its
    /// added operations. Inserted operations keep their target graph.
    pub(crate) fn stamp_snapshot(&mut self, snapshot: u64) {
        self.snapshot = snapshot;
        for op in &mut self.added {
            op.set_snapshot(snapshot);
        }
    }

    pub(crate) fn into_parts(self) -> CommitParts {
        CommitParts {
            snapshot: self.snapshot,
            added: self.added,
            inserted: self.inserted,
            modified: self.modified,
            statuses: self.statuses,
        }
    }

    /// A status staged before the operation itself was added moves onto it.
    fn take_staged_status(&mut self, op: &mut Operation) {
        if let Some(status) = self.statuses.remove(&op.uuid()) {
            op.stage_status(status);
        }
    }

    fn staged_new_mut(&mut self, uuid: &Uuid) -> Option<&mut Operation> {
        self.added
            .iter_mut()
            .chain(self.inserted.values_mut().flatten())
            .find(|op| op.uuid() == *uuid)
    }
}

pub(crate) struct CommitParts {
    pub snapshot: u64,
    pub added: Vec<Operation>,
    pub inserted: BTreeMap<u64, Vec<Operation>>,
    pub modified: Vec<Operation>,
    pub statuses: BTreeMap<Uuid, OperationStatus>,
}

/// A read-write transaction spanning any number of pipelines.
///
/// The snapshot number is only assigned when the transaction commits, so
/// snapshot order always matches commit order.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    commits: BTreeMap<String, Commit>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Staging area for `pipeline`, created on first use.
    pub fn pipeline(&mut self, pipeline: &str) -> &mut Commit {
        self.commits.entry(pipeline.to_string()).or_default()
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &str> {
        self.commits.keys().map(String::as_str)
    }

    pub fn add_operation(&mut self, pipeline: &str, op: Operation) {
        self.pipeline(pipeline).add_operation(op);
    }

    pub fn insert_operation(&mut self, pipeline: &str, op: Operation, graph_snapshot: u64) {
        self.pipeline(pipeline).insert_operation(op, graph_snapshot);
    }

    pub fn modify_operation(&mut self, pipeline: &str, op: Operation) {
        self.pipeline(pipeline).modify_operation(op);
    }

    pub fn complete_operation(&mut self, pipeline: &str, op: &Operation) {
        self.pipeline(pipeline).complete_operation(op);
    }

    pub fn skip_operation(&mut self, pipeline: &str, op: &Operation) {
        self.pipeline(pipeline).skip_operation(op);
    }

    pub fn set_pending_status(&mut self, pipeline: &str, op: &Operation, status: OperationStatus) {
        self.pipeline(pipeline).set_pending_status(op, status);
    }

    pub fn is_empty(&self) -> bool {
        self.commits.values().all(Commit::is_empty)
    }

    /// Validate every per-pipeline commit, stamp `snapshot` on them and hand
    /// them out.
    ///
    /// Nothing is returned if any commit is rejected.
    pub fn finish(self, snapshot: u64) -> Result<BTreeMap<String, Commit>> {
        for commit in self.commits.values() {
            commit.validate()?;
        }
        Ok(self
            .commits
            .into_iter()
            .filter(|(_, commit)| !commit.is_empty())
            .map(|(name, mut commit)| {
                commit.stamp_snapshot(snapshot);
                (name, commit)
            })
            .collect())
    }
}
