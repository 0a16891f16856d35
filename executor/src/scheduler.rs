//! The `advance()` loop: walks a run's frontier, routes completed attempts
//! to their successors, assembles upstream context for every freshly
//! created attempt, and keeps join barriers and retries moving.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::config::ExecutorConfig;
use crate::core::context_assembler::{
    assemble_failure_route_context, assemble_join_context, assemble_standard_context,
    filter_failure_route_artifacts,
};
use crate::core::fanout::{plan_batch, select_join_cohort};
use crate::core::routing_evaluator::select_transition;
use crate::core::state_machine::{may_retry, next_status, AttemptEvent};
use crate::error::{ExecutorError, Result};
use crate::model::artifact::ArtifactKind;
use crate::model::ids::RunId;
use crate::model::manifest::AttemptManifest;
use crate::model::routing::RoutingInput;
use crate::model::run::RunStatus;
use crate::model::run_node::{RunNode, RunNodeStatus};
use crate::model::subtask::SubtaskSpec;
use crate::model::tree::{NodeRole, RouteOn, TreeEdge, TreeNode};
use crate::store::Store;

/// What `advance()` did on a single call, for the caller (CLI, tests) to
/// report without re-deriving it from store state.
#[derive(Debug, Clone, Default)]
pub struct AdvanceReport {
    pub nodes_routed: u32,
    pub nodes_retried: u32,
    pub barriers_released: u32,
    pub run_completed: bool,
    pub run_failed: bool,
}

pub struct Scheduler<'a> {
    store: &'a Store,
    config: &'a ExecutorConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a Store, config: &'a ExecutorConfig) -> Self {
        Self { store, config }
    }

    /// Process the run's current frontier once. Bounded by
    /// `config.scheduler.max_nodes_per_tick`; call repeatedly (the CLI's
    /// `advance` subcommand and the public API do) until it reports no
    /// further progress.
    #[instrument(skip(self))]
    pub fn advance(&self, run_id: RunId) -> Result<AdvanceReport> {
        let run = self.store.load_run(run_id)?;
        if !matches!(run.status, RunStatus::Active) {
            return Ok(AdvanceReport::default());
        }

        match self.advance_active(run_id) {
            Ok(report) => Ok(report),
            Err(err) if err.is_structural() => {
                // Store corruption or an unresolvable tree reference: fatal
                // to the run. Best-effort finalize-as-failed, then surface
                // the original error regardless of whether that succeeded.
                let _ = self
                    .store
                    .transition_run_status(run_id, RunStatus::Active, RunStatus::Failed);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn advance_active(&self, run_id: RunId) -> Result<AdvanceReport> {
        let run = self.store.load_run(run_id)?;
        let tree_nodes = self.store.load_tree_nodes(run.tree_id)?;
        let edges = self.store.load_edges(run.tree_id)?;
        let seq_index: HashMap<String, i64> = tree_nodes
            .iter()
            .map(|n| (n.node_key.clone(), n.sequence_index))
            .collect();
        let mut report = AdvanceReport::default();
        let mut budget = self.config.scheduler.max_nodes_per_tick;

        loop {
            if budget == 0 {
                break;
            }
            let frontier = self.store.load_latest_attempts(run_id)?;
            let mut candidates: Vec<&RunNode> = frontier
                .iter()
                .filter(|n| n.status.is_terminal() && !matches!(n.status, RunNodeStatus::Skipped))
                .filter(|n| self.needs_processing(run_id, n).unwrap_or(false))
                .collect();
            // Deterministic order: §4.F "reordering concurrent external
            // inputs produces the same decision sequence."
            candidates.sort_by(|a, b| a.node_key.cmp(&b.node_key));

            let Some(node) = candidates.into_iter().next().cloned() else {
                break;
            };

            if node.batch_index.is_some() {
                self.process_fanout_child(run_id, &node, &mut report)?;
            } else {
                let tree_node = tree_nodes
                    .iter()
                    .find(|t| t.node_key == node.node_key)
                    .ok_or_else(|| ExecutorError::UnknownNodeKey(node.node_key.clone()))?;
                self.process_standard_node(run_id, &node, tree_node, &tree_nodes, &edges, &seq_index, &mut report)?;
            }
            budget -= 1;
        }

        self.apply_rerun_cascade(run_id, &tree_nodes, &edges)?;
        self.maybe_finalize_run(run_id, &mut report)?;
        Ok(report)
    }

    /// A terminal node still needs processing if it has not yet produced a
    /// fresh routing decision (standard nodes) or barrier credit (fan-out
    /// children) for its current attempt.
    fn needs_processing(&self, run_id: RunId, node: &RunNode) -> Result<bool> {
        match self.store.load_latest_routing_decision(run_id, node.id)? {
            Some(decision) => {
                if !decision.is_fresh_for(node.attempt_number) {
                    return Ok(true);
                }
                let latest_artifact_id = self
                    .store
                    .load_latest_non_noise_artifact(run_id, &node.node_key)?
                    .map(|a| a.id.get());
                Ok(!decision.is_applicable(latest_artifact_id))
            }
            None => Ok(true),
        }
    }

    // -- Standard (tree-authored) nodes --------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn process_standard_node(
        &self,
        run_id: RunId,
        node: &RunNode,
        tree_node: &TreeNode,
        tree_nodes: &[TreeNode],
        edges: &[TreeEdge],
        seq_index: &HashMap<String, i64>,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        if matches!(node.status, RunNodeStatus::Failed) && may_retry(node, tree_node.max_retries) {
            let next = self.retry_with_bound(|| self.store.create_next_attempt(run_id, &node.node_key))?;
            self.assemble_and_save_context(run_id, &next, tree_node, tree_nodes, edges, None)?;
            report.nodes_retried += 1;
            return Ok(());
        }

        let retry_exhausted =
            matches!(node.status, RunNodeStatus::Failed) && !may_retry(node, tree_node.max_retries);
        let context = self.decision_context(run_id, &node.node_key)?;
        let input = RoutingInput {
            run_node_id: node.id,
            node_key: node.node_key.clone(),
            source_status: node.status,
            retry_exhausted,
            context,
        };
        let selected = select_transition(&input, edges, seq_index);
        let informing_artifact_id = self
            .store
            .load_latest_non_noise_artifact(run_id, &node.node_key)?
            .map(|a| a.id.get());

        self.store.insert_routing_decision(
            run_id,
            node.id,
            node.attempt_number,
            selected.as_ref().map(|s| s.edge_id),
            selected.as_ref().map(|s| s.target_node_key.as_str()),
            informing_artifact_id,
        )?;

        if let Some(selection) = selected {
            let target_tree_node = tree_nodes
                .iter()
                .find(|t| t.node_key == selection.target_node_key)
                .ok_or_else(|| ExecutorError::UnknownNodeKey(selection.target_node_key.clone()))?;
            let edge = edges
                .iter()
                .find(|e| e.id == selection.edge_id)
                .ok_or(ExecutorError::UnknownEdge(selection.edge_id.get()))?;

            if matches!(tree_node.node_role, NodeRole::Spawner)
                && matches!(node.status, RunNodeStatus::Succeeded)
                && matches!(target_tree_node.node_role, NodeRole::Join)
            {
                self.dispatch_spawner(run_id, node, tree_node, tree_nodes, edges, &target_tree_node.node_key)?;
            } else {
                let existing = self.store.load_latest_attempt(run_id, &selection.target_node_key)?;
                if existing.as_ref().is_some_and(|n| !n.status.is_terminal()) {
                    debug!(target_node_key = %selection.target_node_key, "already in flight, nothing to do");
                } else {
                    let failure_source = matches!(edge.route_on, RouteOn::Failure).then(|| node.node_key.clone());
                    let next = self.retry_with_bound(|| {
                        if existing.is_some() {
                            self.store.create_next_attempt(run_id, &selection.target_node_key)
                        } else {
                            self.store
                                .create_root_run_node(run_id, &selection.target_node_key, Some(node.id), None)
                        }
                    })?;
                    self.assemble_and_save_context(
                        run_id,
                        &next,
                        target_tree_node,
                        tree_nodes,
                        edges,
                        failure_source.as_deref(),
                    )?;
                }
            }
        }
        report.nodes_routed += 1;
        Ok(())
    }

    /// Build the decision context an edge's guard or the routing evaluator
    /// reasons over: the node's own latest artifact body merged over its
    /// metadata, flattened to a single object.
    fn decision_context(&self, run_id: RunId, node_key: &str) -> Result<Map<String, Value>> {
        let artifacts = self.store.load_artifacts_for_node(run_id, node_key)?;
        let Some(latest) = artifacts.iter().rev().find(|a| !a.is_noise()) else {
            return Ok(Map::new());
        };
        let mut context = Map::new();
        if let Value::Object(body) = &latest.body {
            context.extend(body.clone());
        }
        if let Value::Object(metadata) = &latest.metadata {
            context.extend(metadata.clone());
        }
        Ok(context)
    }

    /// Assemble and persist the upstream context manifest for a freshly
    /// created attempt. `failure_source_node_key` is `Some` when this
    /// attempt was reached via a `route_on = failure` edge, triggering
    /// the additive failure-route path.
    fn assemble_and_save_context(
        &self,
        run_id: RunId,
        attempt: &RunNode,
        target_tree_node: &TreeNode,
        tree_nodes: &[TreeNode],
        edges: &[TreeEdge],
        failure_source_node_key: Option<&str>,
    ) -> Result<()> {
        let mut manifest = AttemptManifest::empty(attempt.id, attempt.attempt_number);

        // Primary path: every success-route predecessor that has completed.
        let mut source_artifacts = Vec::new();
        for edge in edges
            .iter()
            .filter(|e| e.target_node_key == target_tree_node.node_key && matches!(e.route_on, RouteOn::Success))
        {
            let Some(source_attempt) = self.store.load_latest_attempt(run_id, &edge.source_node_key)? else {
                continue;
            };
            if !matches!(source_attempt.status, RunNodeStatus::Succeeded) {
                continue;
            }
            let Some(artifact) = self.store.load_latest_non_noise_artifact(run_id, &edge.source_node_key)? else {
                continue;
            };
            let sequence_index = tree_nodes
                .iter()
                .find(|t| t.node_key == edge.source_node_key)
                .map(|t| t.sequence_index)
                .unwrap_or(i64::MAX);
            source_artifacts.push((edge.source_node_key.clone(), sequence_index, artifact));
        }
        let refs: Vec<(String, i64, &crate::model::artifact::PhaseArtifact)> =
            source_artifacts.iter().map(|(k, s, a)| (k.clone(), *s, a)).collect();
        let primary = assemble_standard_context(&refs);
        manifest.included_source_node_keys = primary.included_source_node_keys;
        manifest.included_artifact_ids = primary.included_artifact_ids;
        manifest.per_source_artifact_ids = primary.per_source_artifact_ids();

        // Failure-route path: additive, only when this attempt was reached
        // via a failure edge and a *current* failure cycle exists.
        if let Some(failing_key) = failure_source_node_key {
            let previous_target_latest_artifact_id = self
                .store
                .load_artifacts_for_node(run_id, &target_tree_node.node_key)?
                .last()
                .map(|a| a.id.get())
                .unwrap_or(0);
            let failing_attempt = self.store.load_latest_attempt(run_id, failing_key)?;
            let source_attempt_number = failing_attempt.map(|a| a.attempt_number).unwrap_or(0);

            let candidates = self
                .store
                .load_artifacts_after(run_id, previous_target_latest_artifact_id)?
                .into_iter()
                .filter(|a| {
                    a.node_key == failing_key
                        && matches!(
                            a.kind,
                            ArtifactKind::Failure | ArtifactKind::ErrorHandlerSummary
                        )
                })
                .collect::<Vec<_>>();
            let filtered = filter_failure_route_artifacts(
                &candidates,
                previous_target_latest_artifact_id,
                source_attempt_number,
                attempt.attempt_number,
            );
            let failure_only: Vec<&crate::model::artifact::PhaseArtifact> = filtered
                .iter()
                .filter(|a| matches!(a.kind, ArtifactKind::Failure))
                .copied()
                .collect();

            if let Some(&failure_artifact) = failure_only.iter().max_by_key(|a| a.id.get()) {
                let retry_summary_id = filtered
                    .iter()
                    .filter(|a| matches!(a.kind, ArtifactKind::ErrorHandlerSummary))
                    .map(|a| a.id.get())
                    .max();
                let sequence_index = tree_nodes
                    .iter()
                    .find(|t| t.node_key == failing_key)
                    .map(|t| t.sequence_index)
                    .unwrap_or(i64::MAX);
                let failure_ctx = assemble_failure_route_context(failing_key, sequence_index, &[failure_artifact]);
                manifest.included_source_node_keys.extend(failure_ctx.included_source_node_keys);
                manifest.included_source_node_keys.sort();
                manifest.included_source_node_keys.dedup();
                manifest.included_artifact_ids.extend(failure_ctx.included_artifact_ids);
                manifest.included_artifact_ids.sort_unstable();
                manifest.failure_route_context_included = true;
                manifest.failure_route_source_node_key = Some(failing_key.to_string());
                manifest.failure_route_failure_artifact_id = Some(failure_artifact.id.get());
                manifest.failure_route_retry_summary_artifact_id = retry_summary_id;
            }
        }

        self.store.save_attempt_manifest(run_id, &manifest)
    }

    // -- Fan-out / join ---------------------------------------------------

    fn dispatch_spawner(
        &self,
        run_id: RunId,
        spawner: &RunNode,
        spawner_tree_node: &TreeNode,
        tree_nodes: &[TreeNode],
        edges: &[TreeEdge],
        join_node_key: &str,
    ) -> Result<()> {
        let subtasks = self.load_subtasks(run_id, &spawner.node_key)?;
        let batch_index = self.store.next_batch_index(run_id, join_node_key, &spawner.node_key)?;

        match plan_batch(spawner.id, 0, subtasks.len() as u32, spawner_tree_node.max_children, self.config.max_children_ceiling) {
            Ok(count) => {
                for subtask in subtasks.iter().take(count as usize) {
                    self.retry_with_bound(|| {
                        self.store.create_root_run_node(run_id, &subtask.node_key, Some(spawner.id), Some(batch_index))
                    })?;
                }
                self.store
                    .create_barrier(run_id, join_node_key, &spawner.node_key, batch_index, count)?;
                if count == 0 {
                    self.dispatch_join_cohort(run_id, join_node_key)?;
                }
                Ok(())
            }
            Err(ExecutorError::SpawnerOverflow { max_children, .. }) => {
                self.store.insert_artifact(
                    run_id,
                    spawner.id,
                    &spawner.node_key,
                    spawner.attempt_number,
                    ArtifactKind::Failure,
                    0,
                    &serde_json::json!({"error": "spawner_overflow"}),
                    &serde_json::json!({"max_children": max_children, "requested": subtasks.len()}),
                )?;
                let failure_input = RoutingInput {
                    run_node_id: spawner.id,
                    node_key: spawner.node_key.clone(),
                    source_status: RunNodeStatus::Failed,
                    retry_exhausted: true,
                    context: Map::new(),
                };
                let seq_index: HashMap<String, i64> =
                    tree_nodes.iter().map(|n| (n.node_key.clone(), n.sequence_index)).collect();
                let selected = select_transition(&failure_input, edges, &seq_index);
                self.store.insert_routing_decision(
                    run_id,
                    spawner.id,
                    spawner.attempt_number,
                    selected.as_ref().map(|s| s.edge_id),
                    selected.as_ref().map(|s| s.target_node_key.as_str()),
                    None,
                )?;
                if let Some(selection) = selected {
                    let target_tree_node = tree_nodes
                        .iter()
                        .find(|t| t.node_key == selection.target_node_key)
                        .ok_or_else(|| ExecutorError::UnknownNodeKey(selection.target_node_key.clone()))?;
                    let next = self.retry_with_bound(|| {
                        self.store
                            .create_root_run_node(run_id, &selection.target_node_key, Some(spawner.id), None)
                    })?;
                    self.assemble_and_save_context(
                        run_id,
                        &next,
                        target_tree_node,
                        tree_nodes,
                        edges,
                        Some(&spawner.node_key),
                    )?;
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn load_subtasks(&self, run_id: RunId, spawner_node_key: &str) -> Result<Vec<SubtaskSpec>> {
        let Some(artifact) = self.store.load_latest_non_noise_artifact(run_id, spawner_node_key)? else {
            return Ok(Vec::new());
        };
        let raw = artifact.metadata.get("subtasks").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(raw).map_err(ExecutorError::from)
    }

    fn process_fanout_child(&self, run_id: RunId, node: &RunNode, report: &mut AdvanceReport) -> Result<()> {
        let parent_id = node
            .parent_run_node_id
            .ok_or_else(|| ExecutorError::Corrupt(format!("fan-out child {} has no parent", node.id)))?;
        let parent = self.store.load_run_node(parent_id)?;
        let batch_index = node
            .batch_index
            .ok_or_else(|| ExecutorError::Corrupt(format!("fan-out child {} has no batch_index", node.id)))?;
        let barrier = self
            .store
            .load_barrier_by_spawner_batch(run_id, &parent.node_key, batch_index)?
            .ok_or_else(|| ExecutorError::Corrupt(format!("no barrier for spawner {} batch {}", parent.node_key, batch_index)))?;

        let barrier = self.store.record_child_terminal(barrier.id, node.id, node.status)?;

        if matches!(node.status, RunNodeStatus::Failed) && may_retry(node, self.config.max_retries_default) {
            self.store.reopen_barrier_for_child(barrier.id, node.id)?;
            self.retry_with_bound(|| self.store.create_next_attempt(run_id, &node.node_key))?;
            report.nodes_retried += 1;
            return Ok(());
        }

        let informing_artifact_id = self
            .store
            .load_latest_non_noise_artifact(run_id, &node.node_key)?
            .map(|a| a.id.get());
        self.store.insert_routing_decision(
            run_id,
            node.id,
            node.attempt_number,
            None,
            Some(&barrier.join_node_key),
            informing_artifact_id,
        )?;
        report.nodes_routed += 1;

        if barrier.is_ready() {
            let dispatched = self.dispatch_join_cohort(run_id, &barrier.join_node_key)?;
            report.barriers_released += dispatched;
        }
        Ok(())
    }

    /// Recompute the full cohort for `join_node_key` (every ready barrier at
    /// or above the reopened floor, per `select_join_cohort`) and (re)dispatch
    /// the join node over their union, overwriting its pending attempt's
    /// manifest with the recomputed union each time.
    ///
    /// This does **not** mark any barrier `Released` — a barrier included in
    /// a dispatched cohort stays `Ready` until `finalize_join_barriers` is
    /// called once the join's own attempt goes terminal. That deferral is
    /// what lets a later batch's dispatch still be unioned with an earlier
    /// batch that gets reopened before the join attempt has been reported on:
    /// marking barriers `Released` as soon as they're dispatched would let a
    /// later-arriving reopen slip through the floor check in
    /// `select_join_cohort` (a `Released` barrier can't become a floor) and
    /// never get unioned in.
    fn dispatch_join_cohort(&self, run_id: RunId, join_node_key: &str) -> Result<u32> {
        let barriers = self.store.load_barriers_for_join(run_id, join_node_key)?;
        let cohort = select_join_cohort(&barriers);
        if cohort.is_empty() {
            return Ok(0);
        }

        let mut sources = Vec::new();
        let mut spawner_ids = Vec::new();
        let mut total = 0u32;
        let mut terminal = 0u32;
        let mut succeeded = 0u32;
        let mut failed = 0u32;

        for barrier in &cohort {
            let (b_succeeded, b_failed, b_cancelled) = self.store.barrier_child_status_counts(barrier.id)?;
            total += barrier.expected_count;
            terminal += b_succeeded + b_failed + b_cancelled;
            succeeded += b_succeeded;
            failed += b_failed;

            for child_id in self.store.load_children_for_barrier(barrier.id)? {
                let child = self.store.load_run_node(child_id)?;
                if let Some(parent_id) = child.parent_run_node_id {
                    spawner_ids.push(parent_id.get());
                }
                if let Some(artifact) = self.store.load_latest_non_noise_artifact(run_id, &child.node_key)? {
                    // Fan-out children have no tree-authored sequence_index;
                    // ordering falls back to node_key ascending (see
                    // DESIGN.md).
                    sources.push((child.node_key.clone(), 0i64, artifact));
                }
            }
        }

        let refs: Vec<(String, i64, &crate::model::artifact::PhaseArtifact)> =
            sources.iter().map(|(k, s, a)| (k.clone(), *s, a)).collect();
        let assembled = assemble_join_context(&refs);

        spawner_ids.sort_unstable();
        spawner_ids.dedup();

        let join_attempt = self.spawn_join_attempt(run_id, join_node_key)?;

        let mut manifest = AttemptManifest::empty(join_attempt.id, join_attempt.attempt_number);
        manifest.included_source_node_keys = assembled.included_source_node_keys;
        manifest.included_artifact_ids = assembled.included_artifact_ids;
        manifest.per_source_artifact_ids = assembled.per_source_artifact_ids();
        manifest.spawner_run_node_ids = spawner_ids;
        manifest.subtasks_total = Some(total);
        manifest.subtasks_terminal = Some(terminal);
        manifest.subtasks_succeeded = Some(succeeded);
        manifest.subtasks_failed = Some(failed);
        self.store.save_attempt_manifest(run_id, &manifest)?;
        Ok(cohort.len() as u32)
    }

    /// The join's attempt for the cohort just released: its existing
    /// `awaiting_join` first attempt transitioned in place, or a fresh
    /// attempt if the join has already run a prior batch to completion.
    fn spawn_join_attempt(&self, run_id: RunId, join_node_key: &str) -> Result<RunNode> {
        let current = self
            .store
            .load_latest_attempt(run_id, join_node_key)?
            .ok_or_else(|| ExecutorError::UnknownNodeKey(join_node_key.to_string()))?;
        match current.status {
            RunNodeStatus::AwaitingJoin => {
                let target_status = next_status(RunNodeStatus::AwaitingJoin, AttemptEvent::BarrierSatisfied)?;
                self.retry_with_bound(|| {
                    self.store.transition_run_node_status(current.id, current.version, target_status)
                })?;
                self.store.load_run_node(current.id)
            }
            status if status.is_terminal() => self
                .retry_with_bound(|| self.store.create_next_attempt_with_status(run_id, join_node_key, RunNodeStatus::Pending)),
            _ => Ok(current),
        }
    }

    // -- Rerun cascade ------------------------------------------------------

    /// A completed node whose upstream has produced a fresher non-noise
    /// artifact than the one it last consumed, and which has already
    /// routed forward (so some consumer's decision depends on it), gets
    /// a fresh attempt scheduled so that consumer can be re-fed.
    fn apply_rerun_cascade(&self, run_id: RunId, tree_nodes: &[TreeNode], edges: &[TreeEdge]) -> Result<()> {
        let frontier = self.store.load_latest_attempts(run_id)?;
        for node in &frontier {
            if !matches!(node.status, RunNodeStatus::Succeeded) {
                continue;
            }
            let Some(manifest) = self.store.load_attempt_manifest(node.id, node.attempt_number)? else {
                continue;
            };
            let has_routed = self.store.load_latest_routing_decision(run_id, node.id)?.is_some();
            if !has_routed {
                continue;
            }
            let mut stale = false;
            for (source_key, consumed_id) in &manifest.per_source_artifact_ids {
                if let Some(latest) = self.store.load_latest_non_noise_artifact(run_id, source_key)? {
                    if latest.id.get() > *consumed_id {
                        stale = true;
                        break;
                    }
                }
            }
            if stale {
                let tree_node = tree_nodes.iter().find(|t| t.node_key == node.node_key);
                let next = self.retry_with_bound(|| self.store.create_next_attempt(run_id, &node.node_key))?;
                if let Some(tree_node) = tree_node {
                    self.assemble_and_save_context(run_id, &next, tree_node, tree_nodes, edges, None)?;
                }
            }
        }
        Ok(())
    }

    fn maybe_finalize_run(&self, run_id: RunId, report: &mut AdvanceReport) -> Result<()> {
        let frontier = self.store.load_latest_attempts(run_id)?;
        if frontier.is_empty() {
            return Ok(());
        }
        let all_terminal = frontier.iter().all(|n| n.status.is_terminal());
        let barriers = self.store.load_all_barriers_for_run(run_id)?;
        let barriers_quiescent = barriers
            .iter()
            .all(|b| matches!(b.state, crate::model::barrier::BarrierState::Released));
        if !all_terminal || !barriers_quiescent {
            return Ok(());
        }

        let mut any_dead_end_failure = false;
        for node in &frontier {
            if !matches!(node.status, RunNodeStatus::Failed) {
                continue;
            }
            let decision = self.store.load_latest_routing_decision(run_id, node.id)?;
            if decision.is_none_or(|d| d.selected_edge_id.is_none()) {
                any_dead_end_failure = true;
                break;
            }
        }

        if any_dead_end_failure {
            self.store
                .transition_run_status(run_id, RunStatus::Active, RunStatus::Failed)?;
            report.run_failed = true;
        } else {
            self.store
                .transition_run_status(run_id, RunStatus::Active, RunStatus::Completed)?;
            report.run_completed = true;
        }
        Ok(())
    }

    /// Reload-and-retry wrapper for the compare-and-swap writes whose only
    /// expected failure mode is `StaleTransition`; anything else propagates
    /// immediately.
    fn retry_with_bound<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_stale_transition() && attempts < self.config.cas_retry_limit => {
                    attempts += 1;
                    warn!(attempts, "retrying after stale transition");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn cancel_run(store: &Store, run_id: RunId) -> Result<()> {
    let run = store.load_run(run_id)?;
    if matches!(
        run.status,
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
    ) {
        return Ok(());
    }
    store.transition_run_status(run_id, run.status, RunStatus::Cancelled)
}

/// Mark every barrier in `join_node_key`'s currently-selected cohort
/// `released`, once the attempt that consumed them has itself gone terminal.
/// Called from `Executor::report_attempt_result` right after a node's status
/// transitions; a no-op for any `node_key` that isn't a join (no barriers
/// will match it).
pub fn finalize_join_barriers(store: &Store, run_id: RunId, join_node_key: &str) -> Result<u32> {
    let barriers = store.load_barriers_for_join(run_id, join_node_key)?;
    let cohort = select_join_cohort(&barriers);
    for barrier in &cohort {
        store.release_barrier(barrier.id)?;
    }
    Ok(cohort.len() as u32)
}
