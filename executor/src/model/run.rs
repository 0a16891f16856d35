//! Workflow run entities: a single execution of a published tree.

use serde::{Deserialize, Serialize};

use crate::model::ids::{RunId, TreeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: RunId,
    pub tree_id: TreeId,
    pub status: RunStatus,
    pub created_at: i64,
    pub updated_at: i64,
}
