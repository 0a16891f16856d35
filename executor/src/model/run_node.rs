//! Run-node entities: the entity-plus-attempt model.
//!
//! A run node's identity is `(run_id, node_key)`; every retry or rerun
//! inserts a new `run_nodes` row carrying an incremented `attempt_number`
//! rather than mutating the previous one. "The run node" as seen by callers
//! is always the latest attempt row for that identity.

use serde::{Deserialize, Serialize};

use crate::model::ids::{RunId, RunNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunNodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    AwaitingJoin,
}

impl RunNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunNodeStatus::Succeeded
                | RunNodeStatus::Failed
                | RunNodeStatus::Cancelled
                | RunNodeStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunNode {
    pub id: RunNodeId,
    pub run_id: RunId,
    pub node_key: String,
    pub attempt_number: u32,
    pub status: RunNodeStatus,
    /// Monotonic per-identity counter bumped on every status write. Status
    /// transitions are compare-and-swapped against this value to detect a
    /// concurrent writer (see `ExecutorError::StaleTransition`).
    pub version: i64,
    pub parent_run_node_id: Option<RunNodeId>,
    /// For a spawner's children, the batch this child belongs to; `None`
    /// for everything else.
    pub batch_index: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RunNode {
    pub fn retries_used(&self) -> u32 {
        self.attempt_number.saturating_sub(1)
    }
}
