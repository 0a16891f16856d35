//! The per-attempt manifest: an auditable record of exactly what upstream
//! material an attempt's assembled context consumed.

use crate::model::ids::RunNodeId;

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptManifest {
    pub run_node_id: RunNodeId,
    pub attempt_number: u32,
    pub included_source_node_keys: Vec<String>,
    pub included_artifact_ids: Vec<i64>,
    /// `(source_node_key, artifact_id)`, sorted by key: the precise per-source
    /// freshness token the rerun cascade compares on a later scheduler tick
    /// (§4.D/§4.F), distinct from the flat `included_artifact_ids` used for
    /// the persisted manifest's audit record.
    pub per_source_artifact_ids: Vec<(String, i64)>,
    pub failure_route_context_included: bool,
    pub failure_route_source_node_key: Option<String>,
    pub failure_route_failure_artifact_id: Option<i64>,
    pub failure_route_retry_summary_artifact_id: Option<i64>,
    /// Join-only: the sorted union of spawner run-node ids contributing to
    /// this join attempt's cohort.
    pub spawner_run_node_ids: Vec<i64>,
    pub subtasks_total: Option<u32>,
    pub subtasks_terminal: Option<u32>,
    pub subtasks_succeeded: Option<u32>,
    pub subtasks_failed: Option<u32>,
}

impl AttemptManifest {
    /// A manifest with no upstream material recorded yet: the baseline for
    /// a leaf node's first attempt, filled in as assembly proceeds.
    pub fn empty(run_node_id: RunNodeId, attempt_number: u32) -> Self {
        Self {
            run_node_id,
            attempt_number,
            included_source_node_keys: Vec::new(),
            included_artifact_ids: Vec::new(),
            per_source_artifact_ids: Vec::new(),
            failure_route_context_included: false,
            failure_route_source_node_key: None,
            failure_route_failure_artifact_id: None,
            failure_route_retry_summary_artifact_id: None,
            spawner_run_node_ids: Vec::new(),
            subtasks_total: None,
            subtasks_terminal: None,
            subtasks_succeeded: None,
            subtasks_failed: None,
        }
    }
}
