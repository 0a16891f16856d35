//! Workflow tree entities: the immutable published specification a run executes.

use serde::{Deserialize, Serialize};

use crate::model::guard::GuardExpression;
use crate::model::ids::{TreeEdgeId, TreeId, TreeNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Human,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Standard,
    Spawner,
    Join,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOn {
    Success,
    Failure,
}

fn default_max_children() -> u32 {
    12
}

/// A node as authored in a tree document, before publication assigns ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNodeSpec {
    pub node_key: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub node_role: NodeRole,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_children")]
    pub max_children: u32,
    pub sequence_index: i64,
}

/// An edge as authored in a tree document, before publication assigns ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEdgeSpec {
    pub source_node_key: String,
    pub target_node_key: String,
    pub route_on: RouteOn,
    pub priority: i64,
    pub auto: bool,
    #[serde(default)]
    pub guard_expression: Option<GuardExpression>,
}

/// A complete tree document as it would be published from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTreeSpec {
    pub tree_key: String,
    pub version: i64,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<TreeNodeSpec>,
    pub edges: Vec<TreeEdgeSpec>,
}

impl WorkflowTreeSpec {
    /// Semantic invariants that a JSON Schema cannot express (cross-field
    /// edge rules, duplicate keys, dangling edge endpoints).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_key.as_str()) {
                errors.push(format!("duplicate node_key '{}'", node.node_key));
            }
        }

        for edge in &self.edges {
            if !seen.contains(edge.source_node_key.as_str()) {
                errors.push(format!(
                    "edge references unknown source_node_key '{}'",
                    edge.source_node_key
                ));
            }
            if !seen.contains(edge.target_node_key.as_str()) {
                errors.push(format!(
                    "edge references unknown target_node_key '{}'",
                    edge.target_node_key
                ));
            }
            if edge.auto && edge.guard_expression.is_some() {
                errors.push(format!(
                    "edge {}->{} is auto but carries a guard_expression",
                    edge.source_node_key, edge.target_node_key
                ));
            }
            if !edge.auto && edge.guard_expression.is_none() {
                errors.push(format!(
                    "edge {}->{} is conditional but has no guard_expression",
                    edge.source_node_key, edge.target_node_key
                ));
            }
            if matches!(edge.route_on, RouteOn::Failure) && !edge.auto {
                errors.push(format!(
                    "edge {}->{} routes on failure but is not auto",
                    edge.source_node_key, edge.target_node_key
                ));
            }
            if let Some(guard) = &edge.guard_expression {
                if let Err(err) = guard.validate() {
                    errors.push(format!(
                        "edge {}->{}: {err}",
                        edge.source_node_key, edge.target_node_key
                    ));
                }
            }
        }
        errors
    }
}

/// A tree node as persisted: ids assigned, tree-local.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: TreeNodeId,
    pub tree_id: TreeId,
    pub node_key: String,
    pub node_type: NodeType,
    pub node_role: NodeRole,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_template: Option<String>,
    pub max_retries: u32,
    pub max_children: u32,
    pub sequence_index: i64,
}

/// An edge as persisted. Source/target node keys are denormalized onto the
/// edge so the (I/O-free) routing evaluator never needs a join back to
/// `tree_nodes` to reason about an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEdge {
    pub id: TreeEdgeId,
    pub tree_id: TreeId,
    pub source_node_key: String,
    pub target_node_key: String,
    pub route_on: RouteOn,
    pub priority: i64,
    pub auto: bool,
    pub guard_expression: Option<GuardExpression>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str) -> TreeNodeSpec {
        TreeNodeSpec {
            node_key: key.to_string(),
            node_type: NodeType::Agent,
            node_role: NodeRole::Standard,
            provider: None,
            model: None,
            prompt_template: None,
            max_retries: 0,
            max_children: 12,
            sequence_index: 0,
        }
    }

    #[test]
    fn rejects_duplicate_node_keys() {
        let spec = WorkflowTreeSpec {
            tree_key: "t".to_string(),
            version: 1,
            description: None,
            nodes: vec![node("a"), node("a")],
            edges: vec![],
        };
        let errors = spec.validate();
        assert!(errors.iter().any(|e| e.contains("duplicate node_key")));
    }

    #[test]
    fn rejects_failure_edge_with_guard() {
        let spec = WorkflowTreeSpec {
            tree_key: "t".to_string(),
            version: 1,
            description: None,
            nodes: vec![node("a"), node("b")],
            edges: vec![TreeEdgeSpec {
                source_node_key: "a".to_string(),
                target_node_key: "b".to_string(),
                route_on: RouteOn::Failure,
                priority: 0,
                auto: false,
                guard_expression: Some(GuardExpression::Condition {
                    field: "x".to_string(),
                    operator: crate::model::guard::Operator::Eq,
                    value: crate::model::guard::GuardValue::Bool(true),
                }),
            }],
        };
        let errors = spec.validate();
        assert!(errors.iter().any(|e| e.contains("not auto")));
        assert!(errors.iter().any(|e| e.contains("carries a guard_expression")));
    }

    #[test]
    fn accepts_well_formed_tree() {
        let spec = WorkflowTreeSpec {
            tree_key: "t".to_string(),
            version: 1,
            description: None,
            nodes: vec![node("a"), node("b")],
            edges: vec![
                TreeEdgeSpec {
                    source_node_key: "a".to_string(),
                    target_node_key: "b".to_string(),
                    route_on: RouteOn::Success,
                    priority: 0,
                    auto: true,
                    guard_expression: None,
                },
                TreeEdgeSpec {
                    source_node_key: "a".to_string(),
                    target_node_key: "b".to_string(),
                    route_on: RouteOn::Failure,
                    priority: 1,
                    auto: true,
                    guard_expression: None,
                },
            ],
        };
        assert!(spec.validate().is_empty());
    }
}
