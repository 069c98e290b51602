// src/pipeline/restore.rs

//! Rebuilding a pipeline from persisted operation rows.

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};

use crate::errors::{CloudpipeError, Result};
use crate::graph::Graph;
use crate::operation::Operation;
use crate::pipeline::core::PipelineCore;
use crate::store::PersistedOperation;
use crate::types::PipelineAlgorithm;

/// Refuse to restore under a different algorithm unless migration was
/// requested.
pub fn check_algorithm(
    pipeline: &str,
    stored: Option<PipelineAlgorithm>,
    configured: PipelineAlgorithm,
    migrate_algorithm: bool,
) -> Result<()> {
    match stored {
        Some(previous) if previous != configured => {
            if migrate_algorithm {
                info!(
                    pipeline,
                    %previous,
                    current = %configured,
                    "migrating pipeline algorithm"
                );
                Ok(())
            } else {
                Err(CloudpipeError::AlgorithmChanged {
                    pipeline: pipeline.to_string(),
                    previous,
                    current: configured,
                })
            }
        }
        _ => Ok(()),
    }
}

impl PipelineCore {
    /// Replace the queue with `records`.
    ///
    /// Rows are grouped by snapshot; within a snapshot their order is kept.
    /// Statuses (including Active) and holds are taken as stored and no
    /// scheduling pass runs. Returns the number of restored operations.
    pub fn restore(&mut self, records: Vec<PersistedOperation>) -> usize {
        self.graphs.clear();
        self.holds.clear();

        let mut seen = HashSet::new();
        let mut grouped: BTreeMap<u64, Vec<Operation>> = BTreeMap::new();

        for PersistedOperation { mut operation, holds } in records {
            let uuid = operation.uuid();
            if !seen.insert(uuid) {
                warn!(pipeline = %self.name(), operation = %uuid, "duplicate stored operation; ignoring");
                continue;
            }
            operation.clear_pending_status();
            if operation.is_terminal() {
                warn!(
                    pipeline = %self.name(),
                    operation = %uuid,
                    status = ?operation.status(),
                    "stored operation is already finished; not restoring"
                );
                continue;
            }

            self.holds.replace(uuid, holds);
            grouped.entry(operation.snapshot()).or_default().push(operation);
        }

        let mut restored = 0;
        for (snapshot, ops) in grouped {
            restored += ops.len();
            self.graphs.insert(snapshot, Graph::new(snapshot, ops));
        }

        self.relink();
        self.refresh_active_flag();

        info!(
            pipeline = %self.name(),
            operations = restored,
            graphs = self.graph_count(),
            active = self.active_count(),
            "restored pipeline"
        );
        restored
    }

    /// Every queued operation with its holds, in graph order.
    pub fn persisted_operations(&self) -> Vec<PersistedOperation> {
        self.graphs()
            .flat_map(|g| g.operations().iter())
            .map(|op| PersistedOperation {
                operation: op.clone(),
                holds: self.holds.for_operation(&op.uuid()).into_iter().collect(),
            })
            .collect()
    }
}
