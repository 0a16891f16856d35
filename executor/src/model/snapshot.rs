//! The observability surface `get_run_snapshot` returns: enough state to
//! diagnose a run without re-deriving it from raw store rows.

use serde::Serialize;

use crate::model::barrier::{BarrierState, JoinBarrier};
use crate::model::ids::RunId;
use crate::model::run::RunStatus;
use crate::model::run_node::{RunNode, RunNodeStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RunNodeSnapshot {
    pub node_key: String,
    pub attempt_number: u32,
    pub status: RunNodeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BarrierSnapshot {
    pub join_node_key: String,
    pub spawner_node_key: String,
    pub batch_index: i64,
    pub state: BarrierState,
    pub expected_count: u32,
    pub completed_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub run_nodes: Vec<RunNodeSnapshot>,
    pub barriers: Vec<BarrierSnapshot>,
}

impl RunNodeSnapshot {
    pub fn from_run_node(node: &RunNode) -> Self {
        Self {
            node_key: node.node_key.clone(),
            attempt_number: node.attempt_number,
            status: node.status,
        }
    }
}

impl BarrierSnapshot {
    pub fn from_barrier(barrier: &JoinBarrier) -> Self {
        Self {
            join_node_key: barrier.join_node_key.clone(),
            spawner_node_key: barrier.spawner_node_key.clone(),
            batch_index: barrier.batch_index,
            state: barrier.state,
            expected_count: barrier.expected_count,
            completed_count: barrier.completed_count,
        }
    }
}
