// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a pipeline orders operations that come from different commits.
///
/// - `CommitGraph`: graphs run strictly one at a time, in snapshot order.
///   Every operation of graph N must be completed or skipped before anything
///   in graph N+1 may start (default behaviour).
/// - `FlatGraph`: operations may be started from any graph, subject only to
///   their explicit dependencies, which may point into earlier graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineAlgorithm {
    #[serde(alias = "commit_graph")]
    Commit,
    #[serde(alias = "flat_graph")]
    Flat,
}

impl Default for PipelineAlgorithm {
    fn default() -> Self {
        PipelineAlgorithm::Commit
    }
}

impl PipelineAlgorithm {
    /// Stable integer code used in the pipelines table.
    pub fn as_code(self) -> i64 {
        match self {
            PipelineAlgorithm::Commit => 0,
            PipelineAlgorithm::Flat => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PipelineAlgorithm::Commit),
            1 => Some(PipelineAlgorithm::Flat),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineAlgorithm::Commit => f.write_str("commit"),
            PipelineAlgorithm::Flat => f.write_str("flat"),
        }
    }
}

impl FromStr for PipelineAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "commit" | "commit_graph" => Ok(PipelineAlgorithm::Commit),
            "flat" | "flat_graph" => Ok(PipelineAlgorithm::Flat),
            other => Err(format!(
                "invalid pipeline algorithm: {other} (expected \"commit\" or \"flat\")"
            )),
        }
    }
}

/// Lifecycle status of an operation.
///
/// Allowed edges:
/// - `Pending -> Active` (dispatch, or an explicit "already in flight" mark)
/// - `Active -> Pending` (explicit retry)
/// - `Pending | Active -> Completed | Skipped` (via a committed transaction)
///
/// `Completed` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Active,
    Completed,
    Skipped,
}

impl Default for OperationStatus {
    fn default() -> Self {
        OperationStatus::Pending
    }
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Skipped)
    }

    /// Whether moving from `self` to `next` follows a lifecycle edge.
    ///
    /// Equal values are accepted (status writes are idempotent).
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;

        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Active) | (Active, Pending) => true,
            (Pending | Active, Completed | Skipped) => true,
            _ => false,
        }
    }
}
