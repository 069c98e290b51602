// src/store/mod.rs

//! Storage boundary for pipelines and their operations.
//!
//! The scheduler itself never touches storage; a [`crate::registry::Registry`]
//! persists each transaction through an [`OperationStore`] before the
//! pipelines apply it, and reads the rows back on restart.
//!
//! - [`MemoryStore`] keeps everything in process (tests, dry runs).
//! - [`SqliteStore`] persists into a SQLite database file.

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::commit::RowChangeset;
use crate::errors::Result;
use crate::operation::Operation;
use crate::types::PipelineAlgorithm;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Stored identity of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRecord {
    pub rowid: i64,
    pub name: String,
    /// Algorithm stored by an earlier run, `None` for a brand-new pipeline.
    pub previous_algorithm: Option<PipelineAlgorithm>,
}

/// An operation row as read back from storage, with its holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedOperation {
    pub operation: Operation,
    pub holds: BTreeMap<String, DateTime<Utc>>,
}

impl PersistedOperation {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            holds: BTreeMap::new(),
        }
    }
}

/// Row changes for one pipeline inside a storage commit.
#[derive(Debug, Clone)]
pub struct PipelineChangeset {
    pub pipeline_rowid: i64,
    pub changeset: RowChangeset,
}

pub trait OperationStore: Send {
    /// Find a pipeline by `name`, then by any of `previous_names`, without
    /// changing anything. The record carries the name it is stored under.
    fn lookup_pipeline(
        &self,
        name: &str,
        previous_names: &BTreeSet<String>,
    ) -> Result<Option<PipelineRecord>>;

    /// Look a pipeline up by `name`, then by any of `previous_names`.
    ///
    /// A pipeline found under a previous name is renamed in place. A pipeline
    /// not found at all is created with `algorithm`. The stored algorithm is
    /// never changed here; see [`OperationStore::set_pipeline_algorithm`].
    fn register_pipeline(
        &mut self,
        name: &str,
        previous_names: &BTreeSet<String>,
        algorithm: PipelineAlgorithm,
    ) -> Result<PipelineRecord>;

    fn set_pipeline_algorithm(&mut self, pipeline_rowid: i64, algorithm: PipelineAlgorithm) -> Result<()>;

    /// Snapshot number of the most recent storage commit (0 if none).
    fn last_snapshot(&self) -> Result<u64>;

    /// Snapshot number the next storage commit will receive.
    fn next_snapshot(&self) -> Result<u64> {
        Ok(self.last_snapshot()? + 1)
    }

    /// Write every changeset and record `snapshot` as the latest snapshot,
    /// all or nothing.
    ///
    /// Returns the rowids assigned to inserted rows.
    fn apply_changesets(
        &mut self,
        snapshot: u64,
        changesets: &[PipelineChangeset],
    ) -> Result<HashMap<Uuid, i64>>;

    /// Replace every stored hold of an operation.
    fn save_holds(&mut self, uuid: Uuid, holds: &BTreeMap<String, DateTime<Utc>>) -> Result<()>;

    /// Every operation row of a pipeline, ordered by snapshot and then by
    /// the order the rows were written.
    fn load_operations(&self, pipeline_rowid: i64) -> Result<Vec<PersistedOperation>>;
}
