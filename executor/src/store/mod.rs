//! SQLite-backed persistence for trees, runs, attempts, artifacts, routing
//! decisions, and join barriers.
//!
//! All writes that must be atomic with a read (every status transition, any
//! barrier update, attempt creation) run inside a `BEGIN IMMEDIATE`
//! transaction: SQLite upgrades the write lock immediately rather than at
//! first write, which is what gives the scheduler serializable status
//! transitions without hand-rolled locking.

mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::{ExecutorError, Result};
use crate::model::artifact::{ArtifactKind, PhaseArtifact};
use crate::model::barrier::{BarrierState, JoinBarrier};
use crate::model::guard::GuardExpression;
use crate::model::ids::{
    ArtifactId, BarrierId, RoutingDecisionId, RunId, RunNodeId, TreeEdgeId, TreeId, TreeNodeId,
};
use crate::model::manifest::AttemptManifest;
use crate::model::routing::RoutingDecision;
use crate::model::run::{RunStatus, WorkflowRun};
use crate::model::run_node::{RunNode, RunNodeStatus};
use crate::model::tree::{NodeRole, NodeType, RouteOn, TreeEdge, TreeNode, WorkflowTreeSpec};

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn to_snake<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .expect("enum serializes to a bare string")
}

fn from_snake<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|e| ExecutorError::Corrupt(format!("unrecognized enum value '{raw}': {e}")))
}

/// The executor's persistence handle. Cheap to clone-by-reference (an
/// `Arc<Store>` is the expected sharing pattern); internally a single
/// connection guarded by a mutex, matching how SQLite is safely shared
/// across threads that otherwise must serialize writes anyway.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -- Trees ----------------------------------------------------------

    pub fn publish_tree(&self, spec: &WorkflowTreeSpec) -> Result<TreeId> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        tx.execute(
            "INSERT INTO trees (tree_key, version, description, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![spec.tree_key, spec.version, spec.description, ts],
        )?;
        let tree_id = TreeId(tx.last_insert_rowid());

        for node in &spec.nodes {
            tx.execute(
                "INSERT INTO tree_nodes
                    (tree_id, node_key, node_type, node_role, provider, model, prompt_template,
                     max_retries, max_children, sequence_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    tree_id.get(),
                    node.node_key,
                    to_snake(&node.node_type),
                    to_snake(&node.node_role),
                    node.provider,
                    node.model,
                    node.prompt_template,
                    node.max_retries,
                    node.max_children,
                    node.sequence_index,
                ],
            )?;
        }

        for edge in &spec.edges {
            let guard_json = edge
                .guard_expression
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO tree_edges
                    (tree_id, source_node_key, target_node_key, route_on, priority, auto, guard_expression_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tree_id.get(),
                    edge.source_node_key,
                    edge.target_node_key,
                    to_snake(&edge.route_on),
                    edge.priority,
                    edge.auto,
                    guard_json,
                ],
            )?;
        }

        tx.commit()?;
        Ok(tree_id)
    }

    /// The id of the highest-`version` tree published under `tree_key`, the
    /// tree `launch_run` materializes a run from.
    pub fn load_latest_tree_by_key(&self, tree_key: &str) -> Result<Option<TreeId>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id FROM trees WHERE tree_key = ?1 ORDER BY version DESC LIMIT 1",
            params![tree_key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(|id| Ok(TreeId(id)))
        .transpose()
    }

    pub fn load_tree_nodes(&self, tree_id: TreeId) -> Result<Vec<TreeNode>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tree_id, node_key, node_type, node_role, provider, model, prompt_template,
                    max_retries, max_children, sequence_index
             FROM tree_nodes WHERE tree_id = ?1 ORDER BY sequence_index ASC",
        )?;
        let rows = stmt.query_map(params![tree_id.get()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, u32>(8)?,
                row.get::<_, u32>(9)?,
                row.get::<_, i64>(10)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, tree_id, node_key, node_type, node_role, provider, model, prompt_template, max_retries, max_children, sequence_index) =
                row?;
            nodes.push(TreeNode {
                id: TreeNodeId(id),
                tree_id: TreeId(tree_id),
                node_key,
                node_type: from_snake::<NodeType>(&node_type)?,
                node_role: from_snake::<NodeRole>(&node_role)?,
                provider,
                model,
                prompt_template,
                max_retries,
                max_children,
                sequence_index,
            });
        }
        Ok(nodes)
    }

    pub fn load_edges(&self, tree_id: TreeId) -> Result<Vec<TreeEdge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tree_id, source_node_key, target_node_key, route_on, priority, auto, guard_expression_json
             FROM tree_edges WHERE tree_id = ?1 ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![tree_id.get()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut edges = Vec::new();
        for row in rows {
            let (id, tree_id, source_node_key, target_node_key, route_on, priority, auto, guard_json) = row?;
            let guard_expression = guard_json
                .map(|raw| serde_json::from_str::<GuardExpression>(&raw))
                .transpose()?;
            edges.push(TreeEdge {
                id: TreeEdgeId(id),
                tree_id: TreeId(tree_id),
                source_node_key,
                target_node_key,
                route_on: from_snake::<RouteOn>(&route_on)?,
                priority,
                auto,
                guard_expression,
            });
        }
        Ok(edges)
    }

    // -- Runs -------------------------------------------------------------

    pub fn create_run(&self, tree_id: TreeId) -> Result<RunId> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO workflow_runs (tree_id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![tree_id.get(), to_snake(&RunStatus::Active), ts],
        )?;
        Ok(RunId(conn.last_insert_rowid()))
    }

    pub fn load_run(&self, run_id: RunId) -> Result<WorkflowRun> {
        let conn = self.lock();
        let (id, tree_id, status_raw, created_at, updated_at) = conn.query_row(
            "SELECT id, tree_id, status, created_at, updated_at FROM workflow_runs WHERE id = ?1",
            params![run_id.get()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;
        Ok(WorkflowRun {
            id: RunId(id),
            tree_id: TreeId(tree_id),
            status: from_snake::<RunStatus>(&status_raw)?,
            created_at,
            updated_at,
        })
    }

    /// Compare-and-swap a run's status, failing with
    /// `ExecutorError::StaleRunTransition` if the run is no longer in
    /// `expected_from` (e.g. another writer already finalized it).
    pub fn transition_run_status(
        &self,
        run_id: RunId,
        expected_from: RunStatus,
        new_status: RunStatus,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            let changed = conn.execute(
                "UPDATE workflow_runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to_snake(&new_status), now_ts(), run_id.get(), to_snake(&expected_from)],
            )?;
            if changed == 0 {
                return Err(ExecutorError::StaleRunTransition {
                    run_id,
                    expected: to_snake(&expected_from),
                });
            }
            Ok(())
        })();
        match &result {
            Ok(()) => conn.execute("COMMIT", [])?,
            Err(_) => conn.execute("ROLLBACK", [])?,
        };
        result
    }

    // -- Run nodes --------------------------------------------------------

    /// Insert the first attempt (attempt_number = 1) of a node's identity.
    pub fn create_root_run_node(
        &self,
        run_id: RunId,
        node_key: &str,
        parent_run_node_id: Option<RunNodeId>,
        batch_index: Option<i64>,
    ) -> Result<RunNode> {
        self.insert_attempt(run_id, node_key, 1, RunNodeStatus::Pending, parent_run_node_id, batch_index)
    }

    /// Insert the next attempt for an existing node identity (retry or rerun).
    pub fn create_next_attempt(&self, run_id: RunId, node_key: &str) -> Result<RunNode> {
        self.create_next_attempt_with_status(run_id, node_key, RunNodeStatus::Pending)
    }

    /// Same as [`Store::create_root_run_node`], but with the given initial
    /// status rather than `pending` (join nodes start `awaiting_join`).
    pub fn create_root_run_node_with_status(
        &self,
        run_id: RunId,
        node_key: &str,
        status: RunNodeStatus,
    ) -> Result<RunNode> {
        self.insert_attempt(run_id, node_key, 1, status, None, None)
    }

    /// Same as [`Store::create_next_attempt`], but with the given initial
    /// status (a join's next cohort attempt starts `awaiting_join` too).
    pub fn create_next_attempt_with_status(
        &self,
        run_id: RunId,
        node_key: &str,
        status: RunNodeStatus,
    ) -> Result<RunNode> {
        let previous = self
            .load_latest_attempt(run_id, node_key)?
            .ok_or_else(|| ExecutorError::UnknownNodeKey(node_key.to_string()))?;
        self.insert_attempt(
            run_id,
            node_key,
            previous.attempt_number + 1,
            status,
            previous.parent_run_node_id,
            previous.batch_index,
        )
    }

    fn insert_attempt(
        &self,
        run_id: RunId,
        node_key: &str,
        attempt_number: u32,
        status: RunNodeStatus,
        parent_run_node_id: Option<RunNodeId>,
        batch_index: Option<i64>,
    ) -> Result<RunNode> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO run_nodes
                (run_id, node_key, attempt_number, status, version, parent_run_node_id, batch_index, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?7)",
            params![
                run_id.get(),
                node_key,
                attempt_number,
                to_snake(&status),
                parent_run_node_id.map(RunNodeId::get),
                batch_index,
                ts,
            ],
        )?;
        Ok(RunNode {
            id: RunNodeId(conn.last_insert_rowid()),
            run_id,
            node_key: node_key.to_string(),
            attempt_number,
            status,
            version: 1,
            parent_run_node_id,
            batch_index,
            created_at: ts,
            updated_at: ts,
        })
    }

    /// The latest attempt row for every node_key that has one, i.e. the run's
    /// current frontier as seen from the outside.
    pub fn load_latest_attempts(&self, run_id: RunId) -> Result<Vec<RunNode>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.run_id, r.node_key, r.attempt_number, r.status, r.version,
                    r.parent_run_node_id, r.batch_index, r.created_at, r.updated_at
             FROM run_nodes r
             INNER JOIN (
                 SELECT node_key, MAX(attempt_number) AS max_attempt
                 FROM run_nodes WHERE run_id = ?1
                 GROUP BY node_key
             ) latest ON r.node_key = latest.node_key AND r.attempt_number = latest.max_attempt
             WHERE r.run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.get()], map_run_node)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()
    }

    pub fn load_run_node(&self, run_node_id: RunNodeId) -> Result<RunNode> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, node_key, attempt_number, status, version,
                    parent_run_node_id, batch_index, created_at, updated_at
             FROM run_nodes WHERE id = ?1",
            params![run_node_id.get()],
            map_run_node,
        )?
    }

    /// The attempt row for `node_key` at exactly `attempt_number`, distinct
    /// from `load_latest_attempt` which always returns the newest one.
    pub fn load_attempt(&self, run_id: RunId, node_key: &str, attempt_number: u32) -> Result<Option<RunNode>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, node_key, attempt_number, status, version,
                    parent_run_node_id, batch_index, created_at, updated_at
             FROM run_nodes WHERE run_id = ?1 AND node_key = ?2 AND attempt_number = ?3",
            params![run_id.get(), node_key, attempt_number],
            map_run_node,
        )
        .optional()?
        .transpose()
    }

    pub fn load_latest_attempt(&self, run_id: RunId, node_key: &str) -> Result<Option<RunNode>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, node_key, attempt_number, status, version,
                    parent_run_node_id, batch_index, created_at, updated_at
             FROM run_nodes WHERE run_id = ?1 AND node_key = ?2
             ORDER BY attempt_number DESC LIMIT 1",
            params![run_id.get(), node_key],
            map_run_node,
        )
        .optional()?
        .transpose()
    }

    /// Compare-and-swap a run node's status, failing with
    /// `ExecutorError::StaleTransition` if another writer already moved it
    /// past `expected_version`.
    pub fn transition_run_node_status(
        &self,
        run_node_id: RunNodeId,
        expected_version: i64,
        new_status: RunNodeStatus,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            let changed = conn.execute(
                "UPDATE run_nodes SET status = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4",
                params![to_snake(&new_status), now_ts(), run_node_id.get(), expected_version],
            )?;
            if changed == 0 {
                return Err(ExecutorError::StaleTransition {
                    run_node_id,
                    expected: expected_version.to_string(),
                });
            }
            Ok(())
        })();
        match &result {
            Ok(()) => conn.execute("COMMIT", [])?,
            Err(_) => conn.execute("ROLLBACK", [])?,
        };
        result
    }

    // -- Artifacts ----------------------------------------------------------

    pub fn insert_artifact(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
        node_key: &str,
        attempt_number: u32,
        kind: ArtifactKind,
        sequence_index: i64,
        body: &Value,
        metadata: &Value,
    ) -> Result<ArtifactId> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO phase_artifacts
                (run_id, run_node_id, node_key, attempt_number, kind, sequence_index, body_json, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id.get(),
                run_node_id.get(),
                node_key,
                attempt_number,
                to_snake(&kind),
                sequence_index,
                serde_json::to_string(body)?,
                serde_json::to_string(metadata)?,
                ts,
            ],
        )?;
        Ok(ArtifactId(conn.last_insert_rowid()))
    }

    pub fn load_artifacts_for_node(&self, run_id: RunId, node_key: &str) -> Result<Vec<PhaseArtifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, run_node_id, node_key, attempt_number, kind, sequence_index,
                    body_json, metadata_json, created_at
             FROM phase_artifacts WHERE run_id = ?1 AND node_key = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.get(), node_key], map_artifact)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()
    }

    /// Every artifact in the run created after `after_id`, ordered by id.
    /// Used by the context assembler to filter failure-route retry summaries
    /// down to the material produced since the previous handoff.
    pub fn load_artifacts_after(&self, run_id: RunId, after_id: i64) -> Result<Vec<PhaseArtifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, run_node_id, node_key, attempt_number, kind, sequence_index,
                    body_json, metadata_json, created_at
             FROM phase_artifacts WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.get(), after_id], map_artifact)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()
    }

    /// The highest-id artifact for `node_key` whose metadata does not flag
    /// it as noise. This is the canonical freshness token for that node.
    pub fn load_latest_non_noise_artifact(
        &self,
        run_id: RunId,
        node_key: &str,
    ) -> Result<Option<PhaseArtifact>> {
        let artifacts = self.load_artifacts_for_node(run_id, node_key)?;
        Ok(artifacts.into_iter().rev().find(|a| !a.is_noise()))
    }

    /// `loadLatestArtifactsByRunNode`: one freshness token per node_key that
    /// has produced at least one non-noise artifact.
    pub fn load_latest_artifacts_by_run_node(
        &self,
        run_id: RunId,
    ) -> Result<HashMap<String, PhaseArtifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, run_node_id, node_key, attempt_number, kind, sequence_index,
                    body_json, metadata_json, created_at
             FROM phase_artifacts WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.get()], map_artifact)?;
        let mut latest: HashMap<String, PhaseArtifact> = HashMap::new();
        for row in rows {
            let artifact = row??;
            if artifact.is_noise() {
                continue;
            }
            latest.insert(artifact.node_key.clone(), artifact);
        }
        Ok(latest)
    }

    // -- Routing decisions ----------------------------------------------------

    pub fn insert_routing_decision(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
        attempt_number: u32,
        selected_edge_id: Option<TreeEdgeId>,
        target_node_key: Option<&str>,
        informing_artifact_id: Option<i64>,
    ) -> Result<RoutingDecisionId> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO routing_decisions
                (run_id, run_node_id, attempt_number, selected_edge_id, target_node_key, informing_artifact_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (run_node_id, attempt_number) DO UPDATE SET
                selected_edge_id = excluded.selected_edge_id,
                target_node_key = excluded.target_node_key,
                informing_artifact_id = excluded.informing_artifact_id",
            params![
                run_id.get(),
                run_node_id.get(),
                attempt_number,
                selected_edge_id.map(TreeEdgeId::get),
                target_node_key,
                informing_artifact_id,
                ts,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM routing_decisions WHERE run_node_id = ?1 AND attempt_number = ?2",
            params![run_node_id.get(), attempt_number],
            |row| row.get(0),
        )?;
        Ok(RoutingDecisionId(id))
    }

    pub fn load_latest_routing_decision(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
    ) -> Result<Option<RoutingDecision>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, run_node_id, attempt_number, selected_edge_id, target_node_key, informing_artifact_id, created_at
             FROM routing_decisions WHERE run_id = ?1 AND run_node_id = ?2 ORDER BY id DESC LIMIT 1",
            params![run_id.get(), run_node_id.get()],
            |row| {
                Ok(RoutingDecision {
                    id: RoutingDecisionId(row.get(0)?),
                    run_id: RunId(row.get(1)?),
                    run_node_id: RunNodeId(row.get(2)?),
                    attempt_number: row.get(3)?,
                    selected_edge_id: row.get::<_, Option<i64>>(4)?.map(TreeEdgeId),
                    target_node_key: row.get(5)?,
                    informing_artifact_id: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(ExecutorError::from)
    }

    // -- Join barriers --------------------------------------------------------

    /// The next `batch_index` for a spawner routing into `join_node_key`,
    /// i.e. one past the highest batch already recorded (0 for the first).
    pub fn next_batch_index(&self, run_id: RunId, join_node_key: &str, spawner_node_key: &str) -> Result<i64> {
        let conn = self.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(batch_index) FROM join_barriers
             WHERE run_id = ?1 AND join_node_key = ?2 AND spawner_node_key = ?3",
            params![run_id.get(), join_node_key, spawner_node_key],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    /// A spawner emitting zero subtasks closes its barrier `ready` on arrival
    /// rather than waiting on children that will never exist.
    pub fn create_barrier(
        &self,
        run_id: RunId,
        join_node_key: &str,
        spawner_node_key: &str,
        batch_index: i64,
        expected_count: u32,
    ) -> Result<JoinBarrier> {
        let conn = self.lock();
        let ts = now_ts();
        let initial_state = if expected_count == 0 { BarrierState::Ready } else { BarrierState::Open };
        conn.execute(
            "INSERT INTO join_barriers
                (run_id, join_node_key, spawner_node_key, batch_index, expected_count, completed_count, state, reopened, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, ?7, ?7)",
            params![
                run_id.get(),
                join_node_key,
                spawner_node_key,
                batch_index,
                expected_count,
                to_snake(&initial_state),
                ts,
            ],
        )?;
        Ok(JoinBarrier {
            id: BarrierId(conn.last_insert_rowid()),
            run_id,
            join_node_key: join_node_key.to_string(),
            spawner_node_key: spawner_node_key.to_string(),
            batch_index,
            expected_count,
            completed_count: 0,
            state: initial_state,
            reopened: false,
            created_at: ts,
            updated_at: ts,
        })
    }

    /// Every run-node id credited as a terminal child of this barrier, in no
    /// particular order; used to assemble a join's cohort context.
    pub fn load_children_for_barrier(&self, barrier_id: BarrierId) -> Result<Vec<RunNodeId>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT run_node_id FROM join_barrier_children WHERE barrier_id = ?1")?;
        let rows = stmt.query_map(params![barrier_id.get()], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(RunNodeId(row?));
        }
        Ok(out)
    }

    /// Every barrier in the run, across all join nodes; used by the
    /// scheduler to decide whether a run is fully quiesced.
    pub fn load_all_barriers_for_run(&self, run_id: RunId) -> Result<Vec<JoinBarrier>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, join_node_key, spawner_node_key, batch_index, expected_count,
                    completed_count, state, reopened, created_at, updated_at
             FROM join_barriers WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.get()], map_barrier)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn load_barrier(
        &self,
        run_id: RunId,
        join_node_key: &str,
        spawner_node_key: &str,
        batch_index: i64,
    ) -> Result<Option<JoinBarrier>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, join_node_key, spawner_node_key, batch_index, expected_count,
                    completed_count, state, reopened, created_at, updated_at
             FROM join_barriers WHERE run_id = ?1 AND join_node_key = ?2 AND spawner_node_key = ?3 AND batch_index = ?4",
            params![run_id.get(), join_node_key, spawner_node_key, batch_index],
            map_barrier,
        )
        .optional()?
        .transpose()
    }

    /// Find the barrier owning a fan-out child, identified by its spawner's
    /// node_key and the batch it belongs to. Used when a spawned child
    /// reaches a terminal status and must credit its barrier directly,
    /// bypassing ordinary edge routing (dynamic children have no
    /// `tree_edges` row of their own).
    pub fn load_barrier_by_spawner_batch(
        &self,
        run_id: RunId,
        spawner_node_key: &str,
        batch_index: i64,
    ) -> Result<Option<JoinBarrier>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, run_id, join_node_key, spawner_node_key, batch_index, expected_count,
                    completed_count, state, reopened, created_at, updated_at
             FROM join_barriers WHERE run_id = ?1 AND spawner_node_key = ?2 AND batch_index = ?3",
            params![run_id.get(), spawner_node_key, batch_index],
            map_barrier,
        )
        .optional()?
        .transpose()
    }

    pub fn load_barriers_for_join(&self, run_id: RunId, join_node_key: &str) -> Result<Vec<JoinBarrier>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, join_node_key, spawner_node_key, batch_index, expected_count,
                    completed_count, state, reopened, created_at, updated_at
             FROM join_barriers WHERE run_id = ?1 AND join_node_key = ?2 ORDER BY batch_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id.get(), join_node_key], map_barrier)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Record that `run_node_id` (one child of this barrier's batch) has
    /// reached a terminal status, and flip the barrier to `Ready` once every
    /// expected child has a terminal record. Runs under `BEGIN IMMEDIATE` so
    /// two children completing concurrently cannot both observe a stale
    /// count.
    pub fn record_child_terminal(
        &self,
        barrier_id: BarrierId,
        run_node_id: RunNodeId,
        status: RunNodeStatus,
    ) -> Result<JoinBarrier> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<JoinBarrier> {
            conn.execute(
                "INSERT INTO join_barrier_children (barrier_id, run_node_id, terminal_status)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (barrier_id, run_node_id) DO UPDATE SET terminal_status = excluded.terminal_status",
                params![barrier_id.get(), run_node_id.get(), to_snake(&status)],
            )?;
            let completed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM join_barrier_children WHERE barrier_id = ?1",
                params![barrier_id.get()],
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE join_barriers SET completed_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![completed, now_ts(), barrier_id.get()],
            )?;
            let barrier = fetch_barrier(&conn, barrier_id)?;
            if barrier.completed_count >= barrier.expected_count
                && matches!(barrier.state, BarrierState::Open)
            {
                conn.execute(
                    "UPDATE join_barriers SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    params![to_snake(&BarrierState::Ready), now_ts(), barrier_id.get()],
                )?;
                return fetch_barrier(&conn, barrier_id);
            }
            Ok(barrier)
        })();
        match &result {
            Ok(_) => conn.execute("COMMIT", [])?,
            Err(_) => conn.execute("ROLLBACK", [])?,
        };
        result
    }

    /// Counts of terminal children by outcome (succeeded, failed, cancelled),
    /// for the join's manifest subtask tallies.
    pub fn barrier_child_status_counts(&self, barrier_id: BarrierId) -> Result<(u32, u32, u32)> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT terminal_status, COUNT(*) FROM join_barrier_children WHERE barrier_id = ?1 GROUP BY terminal_status",
        )?;
        let rows = stmt.query_map(params![barrier_id.get()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let (mut succeeded, mut failed, mut cancelled) = (0u32, 0u32, 0u32);
        for row in rows {
            let (status_raw, count) = row?;
            match from_snake::<RunNodeStatus>(&status_raw)? {
                RunNodeStatus::Succeeded => succeeded = count as u32,
                RunNodeStatus::Failed => failed = count as u32,
                RunNodeStatus::Cancelled => cancelled = count as u32,
                _ => {}
            }
        }
        Ok((succeeded, failed, cancelled))
    }

    /// A child identity was retried: drop its terminal record (it is no
    /// longer terminal) and fall the barrier back to `Open`, flagging
    /// `reopened` so the fan-out cohort rule treats this batch_index as the
    /// floor for future cohort selection.
    pub fn reopen_barrier_for_child(&self, barrier_id: BarrierId, run_node_id: RunNodeId) -> Result<JoinBarrier> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<JoinBarrier> {
            conn.execute(
                "DELETE FROM join_barrier_children WHERE barrier_id = ?1 AND run_node_id = ?2",
                params![barrier_id.get(), run_node_id.get()],
            )?;
            let completed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM join_barrier_children WHERE barrier_id = ?1",
                params![barrier_id.get()],
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE join_barriers SET completed_count = ?1, state = ?2, reopened = 1, updated_at = ?3 WHERE id = ?4",
                params![completed, to_snake(&BarrierState::Open), now_ts(), barrier_id.get()],
            )?;
            fetch_barrier(&conn, barrier_id)
        })();
        match &result {
            Ok(_) => conn.execute("COMMIT", [])?,
            Err(_) => conn.execute("ROLLBACK", [])?,
        };
        result
    }

    pub fn release_barrier(&self, barrier_id: BarrierId) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE join_barriers SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![to_snake(&BarrierState::Released), now_ts(), barrier_id.get()],
        )?;
        Ok(())
    }

    /// Persist the per-attempt manifest the upstream context assembler
    /// produced for a new attempt. Replaces any prior manifest for the
    /// same attempt, tolerating a retried
    /// `report_attempt_result` callback re-deriving the same context.
    pub fn save_attempt_manifest(&self, run_id: RunId, manifest: &AttemptManifest) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attempt_manifests
                (run_id, run_node_id, attempt_number, included_source_node_keys_json, included_artifact_ids_json,
                 per_source_artifact_ids_json,
                 failure_route_context_included, failure_route_source_node_key, failure_route_failure_artifact_id,
                 failure_route_retry_summary_artifact_id, spawner_run_node_ids_json,
                 subtasks_total, subtasks_terminal, subtasks_succeeded, subtasks_failed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT (run_node_id, attempt_number) DO UPDATE SET
                included_source_node_keys_json = excluded.included_source_node_keys_json,
                included_artifact_ids_json = excluded.included_artifact_ids_json,
                per_source_artifact_ids_json = excluded.per_source_artifact_ids_json,
                failure_route_context_included = excluded.failure_route_context_included,
                failure_route_source_node_key = excluded.failure_route_source_node_key,
                failure_route_failure_artifact_id = excluded.failure_route_failure_artifact_id,
                failure_route_retry_summary_artifact_id = excluded.failure_route_retry_summary_artifact_id,
                spawner_run_node_ids_json = excluded.spawner_run_node_ids_json,
                subtasks_total = excluded.subtasks_total,
                subtasks_terminal = excluded.subtasks_terminal,
                subtasks_succeeded = excluded.subtasks_succeeded,
                subtasks_failed = excluded.subtasks_failed",
            params![
                run_id.get(),
                manifest.run_node_id.get(),
                manifest.attempt_number,
                serde_json::to_string(&manifest.included_source_node_keys)?,
                serde_json::to_string(&manifest.included_artifact_ids)?,
                serde_json::to_string(&manifest.per_source_artifact_ids)?,
                manifest.failure_route_context_included,
                manifest.failure_route_source_node_key,
                manifest.failure_route_failure_artifact_id,
                manifest.failure_route_retry_summary_artifact_id,
                serde_json::to_string(&manifest.spawner_run_node_ids)?,
                manifest.subtasks_total,
                manifest.subtasks_terminal,
                manifest.subtasks_succeeded,
                manifest.subtasks_failed,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn load_attempt_manifest(
        &self,
        run_node_id: RunNodeId,
        attempt_number: u32,
    ) -> Result<Option<AttemptManifest>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT included_source_node_keys_json, included_artifact_ids_json,
                    per_source_artifact_ids_json,
                    failure_route_context_included, failure_route_source_node_key, failure_route_failure_artifact_id,
                    failure_route_retry_summary_artifact_id, spawner_run_node_ids_json,
                    subtasks_total, subtasks_terminal, subtasks_succeeded, subtasks_failed
             FROM attempt_manifests WHERE run_node_id = ?1 AND attempt_number = ?2",
            params![run_node_id.get(), attempt_number],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<u32>>(8)?,
                    row.get::<_, Option<u32>>(9)?,
                    row.get::<_, Option<u32>>(10)?,
                    row.get::<_, Option<u32>>(11)?,
                ))
            },
        )
        .optional()?
        .map(
            |(keys_raw, ids_raw, per_source_raw, failure_included, failure_source, failure_artifact, retry_summary, spawners_raw, total, terminal, succeeded, failed)| {
                Ok(AttemptManifest {
                    run_node_id,
                    attempt_number,
                    included_source_node_keys: serde_json::from_str(&keys_raw)?,
                    included_artifact_ids: serde_json::from_str(&ids_raw)?,
                    per_source_artifact_ids: serde_json::from_str(&per_source_raw)?,
                    failure_route_context_included: failure_included,
                    failure_route_source_node_key: failure_source,
                    failure_route_failure_artifact_id: failure_artifact,
                    failure_route_retry_summary_artifact_id: retry_summary,
                    spawner_run_node_ids: spawners_raw
                        .map(|raw| serde_json::from_str(&raw))
                        .transpose()?
                        .unwrap_or_default(),
                    subtasks_total: total,
                    subtasks_terminal: terminal,
                    subtasks_succeeded: succeeded,
                    subtasks_failed: failed,
                })
            },
        )
        .transpose()
    }

}

fn fetch_barrier(conn: &Connection, barrier_id: BarrierId) -> Result<JoinBarrier> {
    conn.query_row(
        "SELECT id, run_id, join_node_key, spawner_node_key, batch_index, expected_count,
                completed_count, state, reopened, created_at, updated_at
         FROM join_barriers WHERE id = ?1",
        params![barrier_id.get()],
        map_barrier,
    )?
}

fn map_run_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RunNode>> {
    let status_raw: String = row.get(4)?;
    Ok((|| -> Result<RunNode> {
        Ok(RunNode {
            id: RunNodeId(row.get(0)?),
            run_id: RunId(row.get(1)?),
            node_key: row.get(2)?,
            attempt_number: row.get(3)?,
            status: from_snake::<RunNodeStatus>(&status_raw)?,
            version: row.get(5)?,
            parent_run_node_id: row.get::<_, Option<i64>>(6)?.map(RunNodeId),
            batch_index: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    })())
}

fn map_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PhaseArtifact>> {
    let kind_raw: String = row.get(5)?;
    let body_raw: String = row.get(7)?;
    let metadata_raw: String = row.get(8)?;
    Ok((|| -> Result<PhaseArtifact> {
        Ok(PhaseArtifact {
            id: ArtifactId(row.get(0)?),
            run_id: RunId(row.get(1)?),
            run_node_id: RunNodeId(row.get(2)?),
            node_key: row.get(3)?,
            attempt_number: row.get(4)?,
            kind: from_snake::<ArtifactKind>(&kind_raw)?,
            sequence_index: row.get(6)?,
            body: serde_json::from_str(&body_raw)?,
            metadata: serde_json::from_str(&metadata_raw)?,
            created_at: row.get(9)?,
        })
    })())
}

fn map_barrier(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<JoinBarrier>> {
    let state_raw: String = row.get(7)?;
    Ok((|| -> Result<JoinBarrier> {
        Ok(JoinBarrier {
            id: BarrierId(row.get(0)?),
            run_id: RunId(row.get(1)?),
            join_node_key: row.get(2)?,
            spawner_node_key: row.get(3)?,
            batch_index: row.get(4)?,
            expected_count: row.get(5)?,
            completed_count: row.get(6)?,
            state: from_snake::<BarrierState>(&state_raw)?,
            reopened: row.get::<_, i64>(8)? != 0,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tree::{NodeRole, NodeType, RouteOn, TreeEdgeSpec, TreeNodeSpec};

    fn sample_spec() -> WorkflowTreeSpec {
        WorkflowTreeSpec {
            tree_key: "demo".to_string(),
            version: 1,
            description: None,
            nodes: vec![
                TreeNodeSpec {
                    node_key: "start".to_string(),
                    node_type: NodeType::Agent,
                    node_role: NodeRole::Standard,
                    provider: None,
                    model: None,
                    prompt_template: None,
                    max_retries: 1,
                    max_children: 12,
                    sequence_index: 0,
                },
                TreeNodeSpec {
                    node_key: "finish".to_string(),
                    node_type: NodeType::Agent,
                    node_role: NodeRole::Standard,
                    provider: None,
                    model: None,
                    prompt_template: None,
                    max_retries: 1,
                    max_children: 12,
                    sequence_index: 1,
                },
            ],
            edges: vec![TreeEdgeSpec {
                source_node_key: "start".to_string(),
                target_node_key: "finish".to_string(),
                route_on: RouteOn::Success,
                priority: 0,
                auto: true,
                guard_expression: None,
            }],
        }
    }

    #[test]
    fn publish_and_reload_tree() {
        let store = Store::open_in_memory().expect("open");
        let tree_id = store.publish_tree(&sample_spec()).expect("publish");
        let nodes = store.load_tree_nodes(tree_id).expect("nodes");
        assert_eq!(nodes.len(), 2);
        let edges = store.load_edges(tree_id).expect("edges");
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn attempt_creation_and_cas_transition() {
        let store = Store::open_in_memory().expect("open");
        let tree_id = store.publish_tree(&sample_spec()).expect("publish");
        let run_id = store.create_run(tree_id).expect("create run");
        let node = store.create_root_run_node(run_id, "start", None, None).expect("root");
        assert_eq!(node.attempt_number, 1);
        assert_eq!(node.version, 1);

        store
            .transition_run_node_status(node.id, node.version, RunNodeStatus::Running)
            .expect("transition");

        let stale = store.transition_run_node_status(node.id, node.version, RunNodeStatus::Succeeded);
        assert!(stale.unwrap_err().is_stale_transition());
    }

    #[test]
    fn next_attempt_carries_parent_and_batch() {
        let store = Store::open_in_memory().expect("open");
        let tree_id = store.publish_tree(&sample_spec()).expect("publish");
        let run_id = store.create_run(tree_id).expect("create run");
        store
            .create_root_run_node(run_id, "start", None, Some(3))
            .expect("root");
        let second = store.create_next_attempt(run_id, "start").expect("retry");
        assert_eq!(second.attempt_number, 2);
        assert_eq!(second.batch_index, Some(3));
    }

    #[test]
    fn barrier_reaches_ready_once_expected_met() {
        let store = Store::open_in_memory().expect("open");
        let tree_id = store.publish_tree(&sample_spec()).expect("publish");
        let run_id = store.create_run(tree_id).expect("create run");
        let barrier = store.create_barrier(run_id, "join", "spawner", 0, 2).expect("barrier");
        let child_a = store.create_root_run_node(run_id, "child-a", None, Some(0)).expect("child a");
        let child_b = store.create_root_run_node(run_id, "child-b", None, Some(0)).expect("child b");

        let after_one = store
            .record_child_terminal(barrier.id, child_a.id, RunNodeStatus::Succeeded)
            .expect("inc");
        assert!(!after_one.is_ready());
        let after_two = store
            .record_child_terminal(barrier.id, child_b.id, RunNodeStatus::Succeeded)
            .expect("inc");
        assert!(after_two.is_ready());
        let (succeeded, failed, cancelled) = store.barrier_child_status_counts(barrier.id).expect("counts");
        assert_eq!((succeeded, failed, cancelled), (2, 0, 0));
    }

    #[test]
    fn reopening_a_child_falls_barrier_back_to_open() {
        let store = Store::open_in_memory().expect("open");
        let tree_id = store.publish_tree(&sample_spec()).expect("publish");
        let run_id = store.create_run(tree_id).expect("create run");
        let barrier = store.create_barrier(run_id, "join", "spawner", 0, 1).expect("barrier");
        let child = store.create_root_run_node(run_id, "child-a", None, Some(0)).expect("child");
        let ready = store
            .record_child_terminal(barrier.id, child.id, RunNodeStatus::Failed)
            .expect("inc");
        assert!(ready.is_ready());

        let reopened = store.reopen_barrier_for_child(barrier.id, child.id).expect("reopen");
        assert!(!reopened.is_ready());
        assert!(reopened.reopened);
        assert_eq!(reopened.completed_count, 0);
    }
}
