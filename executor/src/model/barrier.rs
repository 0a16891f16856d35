//! Join barriers: per-batch synchronization points that gate a join node on
//! the completion of a spawner's fanned-out children.

use serde::{Deserialize, Serialize};

use crate::model::ids::{BarrierId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    Open,
    Ready,
    Released,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinBarrier {
    pub id: BarrierId,
    pub run_id: RunId,
    /// Stable node_key of the join node this barrier feeds, not a specific
    /// attempt row (a node's identity outlives any one attempt).
    pub join_node_key: String,
    /// Stable node_key of the spawner whose children this barrier counts.
    pub spawner_node_key: String,
    pub batch_index: i64,
    pub expected_count: u32,
    pub completed_count: u32,
    pub state: BarrierState,
    /// Set once and never cleared: distinguishes a barrier that was ever
    /// reopened by a late-arriving rerun from one that is simply ready for
    /// the first time. Drives the "skip intermediate released batches"
    /// cohort rule in `core::fanout::select_join_cohort`.
    pub reopened: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JoinBarrier {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, BarrierState::Ready) && self.completed_count >= self.expected_count
    }
}
