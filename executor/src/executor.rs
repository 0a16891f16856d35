//! The public `Executor` API surface: `launch_run`, `advance`,
//! `report_attempt_result`, `cancel_run`, `get_run_snapshot`. A thin
//! facade over [`crate::store::Store`] and [`crate::scheduler`] — the
//! thing a dashboard/TUI or provider dispatcher would actually link
//! against.

use std::path::Path;

use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::model::artifact::{ArtifactKind, NewArtifact};
use crate::model::ids::{RunId, RunNodeId, TreeId};
use crate::model::run_node::RunNodeStatus;
use crate::model::snapshot::{BarrierSnapshot, RunNodeSnapshot, RunSnapshot};
use crate::model::tree::{NodeRole, WorkflowTreeSpec};
use crate::scheduler::{AdvanceReport, Scheduler};
use crate::store::Store;

pub struct Executor {
    store: Store,
    config: ExecutorConfig,
}

impl Executor {
    pub fn open(db_path: &Path, config: ExecutorConfig) -> Result<Self> {
        let store = Store::open(db_path)?;
        Ok(Self { store, config })
    }

    pub fn open_in_memory(config: ExecutorConfig) -> Result<Self> {
        let store = Store::open_in_memory()?;
        Ok(Self { store, config })
    }

    /// Publish a tree document; returns the assigned tree id for
    /// `launch_run` to reference by `tree_key` later.
    pub fn publish_tree(&self, spec: &WorkflowTreeSpec) -> Result<TreeId> {
        self.store.publish_tree(spec)
    }

    /// Materialize a new run from the latest published version of
    /// `tree_key`.
    ///
    /// Only the tree's *initial frontier* — nodes with no incoming edge —
    /// is created eagerly, in `pending`. A node
    /// reachable only via some edge is left unmaterialized until the
    /// scheduler actually routes a terminal predecessor to it; creating it
    /// up front would both let a dispatcher start work with no upstream
    /// context assembled, and strand it forever in `pending` on any branch
    /// whose guard never selects it, which would keep the run from ever
    /// reaching a terminal status.
    ///
    /// Join nodes are the one exception: they always have incoming edges
    /// (from their spawner) but must exist before the first batch completes
    /// so the fan-out subsystem has a row to transition, so they are
    /// created as `awaiting_join` regardless (see DESIGN.md).
    pub fn launch_run(&self, tree_key: &str) -> Result<RunId> {
        let tree_id = self
            .store
            .load_latest_tree_by_key(tree_key)?
            .ok_or_else(|| ExecutorError::UnknownNodeKey(tree_key.to_string()))?;
        let run_id = self.store.create_run(tree_id)?;
        let tree_nodes = self.store.load_tree_nodes(tree_id)?;
        let edges = self.store.load_edges(tree_id)?;
        let has_incoming_edge: std::collections::HashSet<&str> =
            edges.iter().map(|e| e.target_node_key.as_str()).collect();
        for node in &tree_nodes {
            if matches!(node.node_role, NodeRole::Join) {
                self.store
                    .create_root_run_node_with_status(run_id, &node.node_key, RunNodeStatus::AwaitingJoin)?;
            } else if !has_incoming_edge.contains(node.node_key.as_str()) {
                self.store
                    .create_root_run_node_with_status(run_id, &node.node_key, RunNodeStatus::Pending)?;
            }
        }
        Ok(run_id)
    }

    /// One scheduling step: route terminal attempts, release satisfied join
    /// barriers, apply the rerun cascade, and finalize the run if quiescent.
    pub fn advance(&self, run_id: RunId) -> Result<AdvanceReport> {
        Scheduler::new(&self.store, &self.config).advance(run_id)
    }

    /// Record a provider's outcome for one attempt. Idempotent: a retried
    /// callback for the same `(run_node_id, attempt)` that reports the same
    /// status again will CAS-fail harmlessly if the node already moved on.
    pub fn report_attempt_result(
        &self,
        run_node_id: RunNodeId,
        status: RunNodeStatus,
        artifacts: Vec<NewArtifact>,
    ) -> Result<()> {
        if !matches!(
            status,
            RunNodeStatus::Succeeded | RunNodeStatus::Failed | RunNodeStatus::Cancelled
        ) {
            return Err(ExecutorError::Corrupt(format!(
                "report_attempt_result called with non-terminal status {status:?}"
            )));
        }
        let node = self.store.load_run_node(run_node_id)?;
        for (index, artifact) in artifacts.into_iter().enumerate() {
            self.store.insert_artifact(
                node.run_id,
                node.id,
                &node.node_key,
                node.attempt_number,
                artifact.kind,
                index as i64,
                &artifact.body,
                &artifact.metadata,
            )?;
        }
        self.store
            .transition_run_node_status(node.id, node.version, status)?;
        // If `node` is a join's own attempt, its currently-dispatched cohort
        // is now safe to mark released — a no-op for any other node_key.
        crate::scheduler::finalize_join_barriers(&self.store, node.run_id, &node.node_key)?;
        Ok(())
    }

    /// A diagnostic note that never invalidates routing: the canonical
    /// `failed_command_output` noise log that freshness computations
    /// ignore.
    pub fn record_noise_log(&self, run_node_id: RunNodeId, content: &str) -> Result<()> {
        let node = self.store.load_run_node(run_node_id)?;
        self.store.insert_artifact(
            node.run_id,
            node.id,
            &node.node_key,
            node.attempt_number,
            ArtifactKind::Log,
            0,
            &Value::String(content.to_string()),
            &serde_json::json!({"kind": crate::model::artifact::METADATA_KIND_FAILED_COMMAND_OUTPUT}),
        )?;
        Ok(())
    }

    pub fn cancel_run(&self, run_id: RunId) -> Result<()> {
        crate::scheduler::cancel_run(&self.store, run_id)
    }

    pub fn get_run_snapshot(&self, run_id: RunId) -> Result<RunSnapshot> {
        let run = self.store.load_run(run_id)?;
        let run_nodes = self
            .store
            .load_latest_attempts(run_id)?
            .iter()
            .map(RunNodeSnapshot::from_run_node)
            .collect();
        let barriers = self
            .store
            .load_all_barriers_for_run(run_id)?
            .iter()
            .map(BarrierSnapshot::from_barrier)
            .collect();
        Ok(RunSnapshot {
            run_id,
            status: run.status,
            run_nodes,
            barriers,
        })
    }
}
