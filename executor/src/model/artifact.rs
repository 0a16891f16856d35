//! Phase artifacts: the immutable output records a run node's attempts
//! produce, consumed downstream by the context assembler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ids::{ArtifactId, RunId, RunNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The principal output of a successful attempt.
    Output,
    /// A raw log record; may or may not be noise (see `PhaseArtifact::is_noise`).
    Log,
    /// A free-form annotation attached to an attempt.
    Note,
    /// Recorded when an attempt fails, carrying the failure detail.
    Failure,
    /// Recorded by the node on the failure route that handles an upstream
    /// failure, summarizing how it was handled for the eventual retarget.
    ErrorHandlerSummary,
}

/// Metadata `kind` value that flags a log as tool noise rather than a
/// semantic product. Ignored by every freshness computation.
pub const METADATA_KIND_FAILED_COMMAND_OUTPUT: &str = "failed_command_output";

/// Metadata `kind` value marking a remediation summary produced by an
/// error-handling node, carrying `source_attempt` / `target_attempt`.
pub const METADATA_KIND_ERROR_HANDLER_SUMMARY: &str = "error_handler_summary";

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseArtifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub run_node_id: RunNodeId,
    pub node_key: String,
    pub attempt_number: u32,
    pub kind: ArtifactKind,
    pub sequence_index: i64,
    pub body: Value,
    /// Free-form metadata the context assembler filters on: carries fields
    /// such as `source_attempt` / `target_attempt` for failure-route
    /// bookkeeping, and the `kind` marker that flags noise.
    pub metadata: Value,
    pub created_at: i64,
}

/// What a provider callback (`report_attempt_result`) hands the executor
/// for one artifact; the store assigns the artifact its id and sequence
/// position relative to the others in the same call.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub kind: ArtifactKind,
    pub body: Value,
    pub metadata: Value,
}

impl PhaseArtifact {
    /// Whether this artifact's `metadata.kind` marks it as tool noise
    /// (`failed_command_output`): ignored by every freshness computation
    /// and immune to invalidating a routing decision.
    pub fn is_noise(&self) -> bool {
        self.metadata
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|k| k == METADATA_KIND_FAILED_COMMAND_OUTPUT)
    }
}
