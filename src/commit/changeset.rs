// src/commit/changeset.rs

//! Row-level write intents derived from a commit.
//!
//! The store consumes a [`RowChangeset`]; nothing on the operation itself
//! records that its row is dirty.

use std::collections::HashSet;

use uuid::Uuid;

use crate::commit::Commit;
use crate::operation::Operation;
use crate::types::OperationStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    /// First write of a new operation.
    Insert(Operation),
    /// Rewrite of priority, dependencies and payload. The stored status is
    /// left alone.
    Modify(Operation),
    /// A non-terminal status change.
    Status { uuid: Uuid, status: OperationStatus },
    /// The operation reached a terminal status; drop its row (and holds).
    Delete { uuid: Uuid },
}

impl RowWrite {
    pub fn uuid(&self) -> Uuid {
        match self {
            RowWrite::Insert(op) | RowWrite::Modify(op) => op.uuid(),
            RowWrite::Status { uuid, .. } | RowWrite::Delete { uuid } => *uuid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowChangeset {
    writes: Vec<RowWrite>,
}

impl RowChangeset {
    /// Build the row writes for `commit`.
    ///
    /// - New operations that are already terminal are never written.
    /// - Delete wins over modify for the same identity.
    pub fn from_commit(commit: &Commit) -> Self {
        let mut writes = Vec::new();
        let deleted: HashSet<Uuid> = commit
            .statuses()
            .iter()
            .filter(|(_, status)| status.is_terminal())
            .map(|(uuid, _)| *uuid)
            .collect();

        let mut new_uuids = HashSet::new();
        for op in commit.new_operations() {
            new_uuids.insert(op.uuid());
            if op.pending_status_is_terminal() {
                continue;
            }
            writes.push(RowWrite::Insert(persistable(op)));
        }

        for op in commit.modified() {
            if deleted.contains(&op.uuid()) || new_uuids.contains(&op.uuid()) {
                continue;
            }
            writes.push(RowWrite::Modify(op.clone()));
        }

        for (uuid, status) in commit.statuses() {
            let uuid = *uuid;
            if status.is_terminal() {
                writes.push(RowWrite::Delete { uuid });
            } else {
                writes.push(RowWrite::Status {
                    uuid,
                    status: *status,
                });
            }
        }

        Self { writes }
    }

    pub fn writes(&self) -> &[RowWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Copy with the staged status folded in, as it should appear on disk.
fn persistable(op: &Operation) -> Operation {
    let mut copy = op.clone();
    copy.apply_pending_status();
    copy
}
