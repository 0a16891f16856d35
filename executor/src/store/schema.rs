//! The executor's SQLite schema.
//!
//! Every mutable entity is append-only at the attempt level: `run_nodes`
//! rows are never updated in place except for their own `status`/`version`
//! columns (the compare-and-swap fields), and a retry or rerun always
//! inserts a new row rather than overwriting the old attempt.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trees (
    id INTEGER PRIMARY KEY,
    tree_key TEXT NOT NULL,
    version INTEGER NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (tree_key, version)
);

CREATE TABLE IF NOT EXISTS tree_nodes (
    id INTEGER PRIMARY KEY,
    tree_id INTEGER NOT NULL REFERENCES trees (id),
    node_key TEXT NOT NULL,
    node_type TEXT NOT NULL,
    node_role TEXT NOT NULL,
    provider TEXT,
    model TEXT,
    prompt_template TEXT,
    max_retries INTEGER NOT NULL,
    max_children INTEGER NOT NULL,
    sequence_index INTEGER NOT NULL,
    UNIQUE (tree_id, node_key)
);

CREATE TABLE IF NOT EXISTS tree_edges (
    id INTEGER PRIMARY KEY,
    tree_id INTEGER NOT NULL REFERENCES trees (id),
    source_node_key TEXT NOT NULL,
    target_node_key TEXT NOT NULL,
    route_on TEXT NOT NULL,
    priority INTEGER NOT NULL,
    auto INTEGER NOT NULL,
    guard_expression_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_tree_edges_source
    ON tree_edges (tree_id, source_node_key);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id INTEGER PRIMARY KEY,
    tree_id INTEGER NOT NULL REFERENCES trees (id),
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS run_nodes (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES workflow_runs (id),
    node_key TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    parent_run_node_id INTEGER REFERENCES run_nodes (id),
    batch_index INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (run_id, node_key, attempt_number)
);

CREATE INDEX IF NOT EXISTS idx_run_nodes_identity
    ON run_nodes (run_id, node_key, attempt_number DESC);

CREATE TABLE IF NOT EXISTS phase_artifacts (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES workflow_runs (id),
    run_node_id INTEGER NOT NULL REFERENCES run_nodes (id),
    node_key TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    kind TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    body_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_phase_artifacts_node
    ON phase_artifacts (run_id, node_key, id);

CREATE TABLE IF NOT EXISTS routing_decisions (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES workflow_runs (id),
    run_node_id INTEGER NOT NULL REFERENCES run_nodes (id),
    attempt_number INTEGER NOT NULL,
    selected_edge_id INTEGER REFERENCES tree_edges (id),
    target_node_key TEXT,
    informing_artifact_id INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_routing_decisions_node
    ON routing_decisions (run_id, run_node_id, id DESC);

-- Exactly zero or one routing decision per (run_node_id, attempt).
CREATE UNIQUE INDEX IF NOT EXISTS uq_routing_decisions_attempt
    ON routing_decisions (run_node_id, attempt_number);

CREATE TABLE IF NOT EXISTS join_barriers (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES workflow_runs (id),
    join_node_key TEXT NOT NULL,
    spawner_node_key TEXT NOT NULL,
    batch_index INTEGER NOT NULL,
    expected_count INTEGER NOT NULL,
    completed_count INTEGER NOT NULL,
    state TEXT NOT NULL,
    reopened INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (run_id, join_node_key, spawner_node_key, batch_index)
);

-- Per-child terminal record backing a barrier's ready/reopen bookkeeping.
-- A child's row exists only while
-- its latest attempt is terminal; retrying it deletes the row, which is
-- what lets a barrier fall back from `ready` to `open`.
CREATE TABLE IF NOT EXISTS join_barrier_children (
    barrier_id INTEGER NOT NULL REFERENCES join_barriers (id),
    run_node_id INTEGER NOT NULL REFERENCES run_nodes (id),
    terminal_status TEXT NOT NULL,
    PRIMARY KEY (barrier_id, run_node_id)
);

-- One row per attempt: the auditable record of exactly what upstream
-- material an attempt's context saw.
CREATE TABLE IF NOT EXISTS attempt_manifests (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES workflow_runs (id),
    run_node_id INTEGER NOT NULL REFERENCES run_nodes (id),
    attempt_number INTEGER NOT NULL,
    included_source_node_keys_json TEXT NOT NULL,
    included_artifact_ids_json TEXT NOT NULL,
    per_source_artifact_ids_json TEXT NOT NULL DEFAULT '[]',
    failure_route_context_included INTEGER NOT NULL,
    failure_route_source_node_key TEXT,
    failure_route_failure_artifact_id INTEGER,
    failure_route_retry_summary_artifact_id INTEGER,
    spawner_run_node_ids_json TEXT,
    subtasks_total INTEGER,
    subtasks_terminal INTEGER,
    subtasks_succeeded INTEGER,
    subtasks_failed INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE (run_node_id, attempt_number)
);
"#;
