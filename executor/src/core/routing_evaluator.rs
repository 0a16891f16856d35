//! Selects the outgoing edge a completed run node should follow.
//!
//! Pure with respect to the store: given the candidate edges leaving a
//! node and the decision context built from that node's terminal status
//! and latest artifact, it picks exactly one edge or none. No I/O, no
//! randomness, no clock reads — the same input always produces the same
//! decision, which is what lets the scheduler treat a routing decision as
//! reusable once it is fresh for an attempt.

use std::collections::HashMap;

use crate::model::ids::TreeEdgeId;
use crate::model::routing::RoutingInput;
use crate::model::run_node::RunNodeStatus;
use crate::model::tree::{RouteOn, TreeEdge};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTransition {
    pub edge_id: TreeEdgeId,
    pub target_node_key: String,
}

/// Evaluate candidate edges for `input` and return the selected transition,
/// or `None` if the node has no outgoing edge that applies (a leaf, or a
/// conditional fork where no guard matched).
///
/// `target_sequence_index` resolves a node_key to its tree-authored
/// `sequence_index`, the second tier of the tie-break order:
/// `(priority, sequence_index of target, source_node_key,
/// target_node_key)`, all ascending. A target absent from the map (should
/// not happen for a published tree) sorts last.
pub fn select_transition(
    input: &RoutingInput,
    edges: &[TreeEdge],
    target_sequence_index: &HashMap<String, i64>,
) -> Option<SelectedTransition> {
    let route_on = if input.retry_exhausted || matches!(input.source_status, RunNodeStatus::Failed) {
        RouteOn::Failure
    } else {
        RouteOn::Success
    };

    let mut candidates: Vec<&TreeEdge> = edges
        .iter()
        .filter(|e| e.source_node_key == input.node_key && e.route_on == route_on)
        .collect();
    candidates.sort_by(|a, b| {
        let seq_a = target_sequence_index.get(&a.target_node_key).copied().unwrap_or(i64::MAX);
        let seq_b = target_sequence_index.get(&b.target_node_key).copied().unwrap_or(i64::MAX);
        a.priority
            .cmp(&b.priority)
            .then_with(|| seq_a.cmp(&seq_b))
            .then_with(|| a.source_node_key.cmp(&b.source_node_key))
            .then_with(|| a.target_node_key.cmp(&b.target_node_key))
    });

    candidates
        .into_iter()
        .find(|edge| edge.auto || edge.guard_expression.as_ref().is_some_and(|g| g.evaluate(&input.context)))
        .map(|edge| SelectedTransition {
            edge_id: edge.id,
            target_node_key: edge.target_node_key.clone(),
        })
}
