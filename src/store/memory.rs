// src/store/memory.rs

//! In-process [`OperationStore`].
//!
//! Clones share the same state, so a test can keep a handle, drop the
//! registry that used it and open a new one to simulate a restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{OperationStore, PersistedOperation, PipelineChangeset, PipelineRecord};
use crate::commit::RowWrite;
use crate::errors::{CloudpipeError, Result};
use crate::operation::Operation;
use crate::types::PipelineAlgorithm;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// (name, algorithm); the rowid is the index plus one.
    pipelines: Vec<(String, PipelineAlgorithm)>,
    next_rowid: i64,
    /// Keyed by rowid, so iteration follows write order.
    rows: BTreeMap<i64, StoredRow>,
    rowids: HashMap<Uuid, i64>,
    holds: HashMap<Uuid, BTreeMap<String, DateTime<Utc>>>,
    last_snapshot: u64,
}

#[derive(Debug, Clone)]
struct StoredRow {
    pipeline_rowid: i64,
    operation: Operation,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operation rows across all pipelines.
    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Stored holds of one operation.
    pub fn holds(&self, uuid: &Uuid) -> BTreeMap<String, DateTime<Utc>> {
        self.lock().holds.get(uuid).cloned().unwrap_or_default()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.lock().pipelines.iter().map(|(n, _)| n.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryState {
    fn apply(&mut self, changes: &PipelineChangeset, assigned: &mut HashMap<Uuid, i64>) -> Result<()> {
        for write in changes.changeset.writes() {
            match write {
                RowWrite::Insert(op) => {
                    if self.rowids.contains_key(&op.uuid()) {
                        return Err(CloudpipeError::Other(anyhow!(
                            "operation {} is already stored",
                            op.uuid()
                        )));
                    }
                    self.next_rowid += 1;
                    let rowid = self.next_rowid;
                    let mut operation = op.clone();
                    operation.set_rowid(rowid);
                    self.rows.insert(
                        rowid,
                        StoredRow {
                            pipeline_rowid: changes.pipeline_rowid,
                            operation,
                        },
                    );
                    self.rowids.insert(op.uuid(), rowid);
                    assigned.insert(op.uuid(), rowid);
                }
                RowWrite::Modify(op) => {
                    if let Some(row) = self.row_mut(&op.uuid()) {
                        row.operation.merge_modification(op);
                    }
                }
                RowWrite::Status { uuid, status } => {
                    if let Some(row) = self.row_mut(uuid) {
                        row.operation.set_status(*status);
                    }
                }
                RowWrite::Delete { uuid } => {
                    if let Some(rowid) = self.rowids.remove(uuid) {
                        self.rows.remove(&rowid);
                    }
                    self.holds.remove(uuid);
                }
            }
        }
        Ok(())
    }

    /// Index of the pipeline stored under `name`, or else under one of
    /// `previous_names`.
    fn find_pipeline(&self, name: &str, previous_names: &BTreeSet<String>) -> Option<usize> {
        self.pipelines
            .iter()
            .position(|(n, _)| n == name)
            .or_else(|| self.pipelines.iter().position(|(n, _)| previous_names.contains(n)))
    }

    fn row_mut(&mut self, uuid: &Uuid) -> Option<&mut StoredRow> {
        let rowid = self.rowids.get(uuid)?;
        self.rows.get_mut(rowid)
    }
}

impl OperationStore for MemoryStore {
    fn lookup_pipeline(
        &self,
        name: &str,
        previous_names: &BTreeSet<String>,
    ) -> Result<Option<PipelineRecord>> {
        let state = self.lock();
        Ok(state.find_pipeline(name, previous_names).map(|idx| {
            let (stored_name, stored_algorithm) = &state.pipelines[idx];
            PipelineRecord {
                rowid: idx as i64 + 1,
                name: stored_name.clone(),
                previous_algorithm: Some(*stored_algorithm),
            }
        }))
    }

    fn register_pipeline(
        &mut self,
        name: &str,
        previous_names: &BTreeSet<String>,
        algorithm: PipelineAlgorithm,
    ) -> Result<PipelineRecord> {
        let mut state = self.lock();

        let record = match state.find_pipeline(name, previous_names) {
            Some(idx) => {
                let (stored_name, stored_algorithm) = &mut state.pipelines[idx];
                if stored_name != name {
                    *stored_name = name.to_string();
                }
                PipelineRecord {
                    rowid: idx as i64 + 1,
                    name: name.to_string(),
                    previous_algorithm: Some(*stored_algorithm),
                }
            }
            None => {
                state.pipelines.push((name.to_string(), algorithm));
                PipelineRecord {
                    rowid: state.pipelines.len() as i64,
                    name: name.to_string(),
                    previous_algorithm: None,
                }
            }
        };
        Ok(record)
    }

    fn set_pipeline_algorithm(&mut self, pipeline_rowid: i64, algorithm: PipelineAlgorithm) -> Result<()> {
        let mut state = self.lock();
        let idx = usize::try_from(pipeline_rowid - 1)
            .ok()
            .filter(|idx| *idx < state.pipelines.len())
            .ok_or_else(|| CloudpipeError::PipelineNotFound(format!("rowid {pipeline_rowid}")))?;
        state.pipelines[idx].1 = algorithm;
        Ok(())
    }

    fn last_snapshot(&self) -> Result<u64> {
        Ok(self.lock().last_snapshot)
    }

    fn apply_changesets(
        &mut self,
        snapshot: u64,
        changesets: &[PipelineChangeset],
    ) -> Result<HashMap<Uuid, i64>> {
        let mut state = self.lock();

        // Work on a copy so a failed write leaves nothing behind.
        let mut next = state.clone();
        let mut assigned = HashMap::new();
        for changes in changesets {
            next.apply(changes, &mut assigned)?;
        }
        next.last_snapshot = next.last_snapshot.max(snapshot);

        *state = next;
        Ok(assigned)
    }

    fn save_holds(&mut self, uuid: Uuid, holds: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock();
        if holds.is_empty() {
            state.holds.remove(&uuid);
        } else {
            state.holds.insert(uuid, holds.clone());
        }
        Ok(())
    }

    fn load_operations(&self, pipeline_rowid: i64) -> Result<Vec<PersistedOperation>> {
        let state = self.lock();
        let mut loaded: Vec<PersistedOperation> = state
            .rows
            .values()
            .filter(|row| row.pipeline_rowid == pipeline_rowid)
            .map(|row| PersistedOperation {
                operation: row.operation.clone(),
                holds: state
                    .holds
                    .get(&row.operation.uuid())
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        // Stable: rows of one snapshot keep their write order.
        loaded.sort_by_key(|p| p.operation.snapshot());
        Ok(loaded)
    }
}
