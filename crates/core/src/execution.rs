//! Execution status vocabulary for a tracked run.
//!
//! [`NodeStatus`] is kept per node, [`ExecuteStatus`] once per run, and
//! [`ExecuteErrorCode`] classifies the terminal failure reported to
//! consumers.

use serde::{Deserialize, Serialize};

/// Status of one node within the active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Finished,
    Error,
}

impl NodeStatus {
    /// Whether the node has been reached by the backend at all.
    pub fn is_started(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Overall status of the active run.
///
/// Moves `Unknown -> Pending -> Running -> {Finished | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    #[default]
    Unknown,
    Pending,
    Running,
    Finished,
    Error,
}

impl ExecuteStatus {
    /// `Finished` and `Error` end the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Queue snapshots only matter before the run starts executing.
    pub fn accepts_queue_updates(self) -> bool {
        matches!(self, Self::Unknown | Self::Pending)
    }
}

/// Classification carried by an `executeError` lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecuteErrorCode {
    /// A node raised an exception while running.
    ExecutionFailed,
    /// The run succeeded but the downstream recorder did not store the result.
    ResultUntracked,
    /// The run was interrupted or timed out server-side.
    ServerTimeout,
}
