//! The crate's single error type. Every fallible public operation returns
//! `Result<T>`; callers that need to distinguish retryable conditions from
//! structural ones match on the variant or use the helper predicates below.

use thiserror::Error;

use crate::model::ids::{BarrierId, RunId, RunNodeId};

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A compare-and-swap status transition lost a race against another
    /// writer. Callers should reload and retry up to a bounded number of
    /// attempts; it is never correct to surface this to an operator.
    #[error("run node {run_node_id} transition from {expected} failed: status changed underneath")]
    StaleTransition {
        run_node_id: RunNodeId,
        expected: String,
    },

    /// The run-level counterpart of `StaleTransition`: `transition_run_status`
    /// was called with an `expected_from` status that no longer matches the
    /// run's current status.
    #[error("run {run_id} transition from {expected} failed: status changed underneath")]
    StaleRunTransition { run_id: RunId, expected: String },

    #[error("join barrier {barrier_id} is in state {actual}, expected {expected}")]
    BarrierStateConflict {
        barrier_id: BarrierId,
        expected: String,
        actual: String,
    },

    #[error("run node {run_node_id} exceeded its attempt limit ({max_retries} retries)")]
    AttemptLimitExceeded {
        run_node_id: RunNodeId,
        max_retries: u32,
    },

    #[error("no tree node with key '{0}' in this tree")]
    UnknownNodeKey(String),

    #[error("no edge with id {0}")]
    UnknownEdge(i64),

    #[error("invalid guard expression: {0}")]
    InvalidGuardExpression(String),

    #[error("spawner {run_node_id} exceeded max_children ({max_children})")]
    SpawnerOverflow {
        run_node_id: RunNodeId,
        max_children: u32,
    },

    /// Data read back from the store violates an invariant the writer side
    /// is supposed to guarantee (e.g. an attempt row with no matching node).
    /// Seeing this means a bug, not a race; it is not retryable.
    #[error("store invariant violated: {0}")]
    Corrupt(String),

    #[error("tree validation failed: {0}")]
    InvalidTree(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl ExecutorError {
    /// Whether a bounded reload-and-retry can plausibly resolve this error.
    pub fn is_stale_transition(&self) -> bool {
        matches!(
            self,
            ExecutorError::StaleTransition { .. } | ExecutorError::StaleRunTransition { .. }
        )
    }

    /// Whether this error reflects a structural problem with the tree or
    /// stored data, as opposed to a transient contention condition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExecutorError::UnknownNodeKey(_)
                | ExecutorError::UnknownEdge(_)
                | ExecutorError::InvalidGuardExpression(_)
                | ExecutorError::InvalidTree(_)
                | ExecutorError::Corrupt(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
