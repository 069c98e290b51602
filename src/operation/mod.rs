// src/operation/mod.rs

//! Operations: the unit of work a pipeline schedules.
//!
//! - [`Operation`] carries identity, priority, dependencies and status.
//! - [`holds`] holds per-context hold dates used for backoff and readiness
//!   gates.

pub mod holds;

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::types::OperationStatus;

pub use holds::HoldTable;

/// A schedulable unit of cloud-sync work.
///
/// Values handed out by a pipeline are always copies; mutating one has no
/// effect until it is passed back through a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    uuid: Uuid,
    rowid: Option<i64>,
    snapshot: u64,
    status: OperationStatus,
    pending_status: Option<OperationStatus>,
    dependencies: BTreeSet<Uuid>,
    priority: i32,
    payload: Vec<u8>,
}

impl Operation {
    /// New pending operation with a fresh identity.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            rowid: None,
            snapshot: 0,
            status: OperationStatus::Pending,
            pending_status: None,
            dependencies: BTreeSet::new(),
            priority: 0,
            payload: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Row handle in the operations table, once written.
    pub fn rowid(&self) -> Option<i64> {
        self.rowid
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Status staged by an uncommitted transaction, if any.
    pub fn pending_status(&self) -> Option<OperationStatus> {
        self.pending_status
    }

    pub fn dependencies(&self) -> &BTreeSet<Uuid> {
        &self.dependencies
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn add_dependency(&mut self, uuid: Uuid) {
        if uuid != self.uuid {
            self.dependencies.insert(uuid);
        }
    }

    pub fn remove_dependency(&mut self, uuid: &Uuid) {
        self.dependencies.remove(uuid);
    }

    pub fn set_dependencies(&mut self, deps: impl IntoIterator<Item = Uuid>) {
        let own = self.uuid;
        self.dependencies = deps.into_iter().filter(|d| *d != own).collect();
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = payload.into();
    }

    /// True if the visible status is completed or skipped.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True if a staged status would make this operation terminal on commit.
    pub fn pending_status_is_terminal(&self) -> bool {
        self.pending_status.is_some_and(OperationStatus::is_terminal)
    }

    /// Status this operation will have once its transaction commits.
    pub fn effective_status(&self) -> OperationStatus {
        self.pending_status.unwrap_or(self.status)
    }

    pub(crate) fn set_rowid(&mut self, rowid: i64) {
        self.rowid = Some(rowid);
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: u64) {
        self.snapshot = snapshot;
    }

    pub(crate) fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
    }

    pub(crate) fn stage_status(&mut self, status: OperationStatus) {
        self.pending_status = Some(status);
    }

    pub(crate) fn clear_pending_status(&mut self) {
        self.pending_status = None;
    }

    /// Make the staged status visible and clear transaction-only state.
    pub(crate) fn apply_pending_status(&mut self) -> Option<OperationStatus> {
        let staged = self.pending_status.take()?;
        self.status = staged;
        Some(staged)
    }

    /// Retain only dependencies accepted by `keep`; returns the dropped ones.
    pub(crate) fn retain_dependencies(&mut self, mut keep: impl FnMut(&Uuid) -> bool) -> Vec<Uuid> {
        let dropped: Vec<Uuid> = self
            .dependencies
            .iter()
            .filter(|d| !keep(d))
            .copied()
            .collect();
        for d in &dropped {
            self.dependencies.remove(d);
        }
        dropped
    }

    /// Copy the caller-editable fields (priority, dependencies, payload) from
    /// `other`. Status is left alone.
    pub(crate) fn merge_modification(&mut self, other: &Operation) {
        self.priority = other.priority;
        self.dependencies = other.dependencies.clone();
        self.payload = other.payload.clone();
        if let Some(rowid) = other.rowid {
            self.rowid.get_or_insert(rowid);
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}
