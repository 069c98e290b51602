// src/commit/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use uuid::Uuid;

use crate::commit::Commit;
use crate::errors::{CloudpipeError, Result};
use crate::operation::Operation;

/// Reject commits whose staged operations depend on each other in a cycle.
///
/// Only edges declared inside the commit are followed; see
/// [`validate_against_queue`] for the check that includes queued operations.
pub fn validate_commit(commit: &Commit) -> Result<()> {
    validate_against_queue(commit, std::iter::empty())
}

/// Reject `commit` if, applied on top of `queued`, it would leave a
/// dependency cycle in the pipeline.
///
/// A modified operation replaces its queued version. Operations that
/// finish in this commit are left out, since they are reaped on apply.
pub fn validate_against_queue<'a>(
    commit: &'a Commit,
    queued: impl IntoIterator<Item = &'a Operation>,
) -> Result<()> {
    let finishing: HashSet<Uuid> = commit
        .statuses()
        .iter()
        .filter(|(_, status)| status.is_terminal())
        .map(|(uuid, _)| *uuid)
        .chain(
            commit
                .new_operations()
                .filter(|op| op.pending_status_is_terminal())
                .map(Operation::uuid),
        )
        .collect();
    let replaced: HashSet<Uuid> = commit.modified().iter().map(Operation::uuid).collect();

    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<Uuid, ()> = DiGraphMap::new();

    let ops = queued
        .into_iter()
        .filter(|op| !replaced.contains(&op.uuid()))
        .chain(commit.new_operations())
        .chain(commit.modified().iter());
    for op in ops {
        if finishing.contains(&op.uuid()) {
            continue;
        }
        graph.add_node(op.uuid());
        for dep in op.dependencies().iter().filter(|d| !finishing.contains(d)) {
            graph.add_edge(*dep, op.uuid(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(CloudpipeError::DependencyCycle(format!(
            "cycle detected in commit {} involving operation {}",
            commit.snapshot(),
            cycle.node_id()
        ))),
    }
}
