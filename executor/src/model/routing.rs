//! Routing decisions: the evaluator's recorded choice of outgoing edge for
//! a completed run node, and the input it was computed from.

use serde_json::{Map, Value};

use crate::model::ids::{RoutingDecisionId, RunId, RunNodeId, TreeEdgeId};
use crate::model::run_node::RunNodeStatus;

/// The input the routing evaluator reasons over. Built by the scheduler
/// from a run node's terminal status plus its latest artifact's metadata.
#[derive(Debug, Clone)]
pub struct RoutingInput {
    pub run_node_id: RunNodeId,
    pub node_key: String,
    pub source_status: RunNodeStatus,
    pub retry_exhausted: bool,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub id: RoutingDecisionId,
    pub run_id: RunId,
    pub run_node_id: RunNodeId,
    pub attempt_number: u32,
    pub selected_edge_id: Option<TreeEdgeId>,
    pub target_node_key: Option<String>,
    /// The source node's freshest non-noise artifact id at the moment this
    /// decision was computed; `None` if the source had no artifact yet.
    /// This is the decision-informing artifact the freshness guard below
    /// compares against.
    pub informing_artifact_id: Option<i64>,
    pub created_at: i64,
}

impl RoutingDecision {
    /// A decision belongs to a given attempt only when it was computed from
    /// that exact attempt; a decision left over from a superseded attempt
    /// must never be reused even if it happens to still be the newest row.
    pub fn is_fresh_for(&self, attempt_number: u32) -> bool {
        self.attempt_number == attempt_number
    }

    /// A decision is applicable only while no non-noise artifact newer
    /// than the one that informed it has since appeared on the source
    /// node. `latest_non_noise_artifact_id` is the source node's current
    /// freshness token (`None` if it has none).
    pub fn is_applicable(&self, latest_non_noise_artifact_id: Option<i64>) -> bool {
        match (self.informing_artifact_id, latest_non_noise_artifact_id) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(informing), Some(latest)) => latest <= informing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(informing: Option<i64>) -> RoutingDecision {
        RoutingDecision {
            id: RoutingDecisionId(1),
            run_id: RunId(1),
            run_node_id: RunNodeId(1),
            attempt_number: 1,
            selected_edge_id: None,
            target_node_key: None,
            informing_artifact_id: informing,
            created_at: 0,
        }
    }

    #[test]
    fn applicable_while_no_fresher_artifact_exists() {
        assert!(decision(Some(1)).is_applicable(Some(1)));
    }

    #[test]
    fn stale_once_a_fresher_non_noise_artifact_appears() {
        assert!(!decision(Some(1)).is_applicable(Some(2)));
    }

    #[test]
    fn decision_with_no_informing_artifact_is_stale_once_one_appears() {
        assert!(!decision(None).is_applicable(Some(1)));
    }
}
