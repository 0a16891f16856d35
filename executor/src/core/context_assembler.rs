//! Assembles the upstream context handed to a run node before it executes:
//! the material produced by whichever predecessors feed it, in a stable
//! order, plus a manifest recording exactly what went in.
//!
//! Operates on already-loaded rows rather than a store handle so the
//! assembly rules (ordering, failure-route filtering, join cohort
//! inclusion) stay unit-testable without a database.

use serde_json::Value;

use crate::model::artifact::PhaseArtifact;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub node_key: String,
    pub sequence_index: i64,
    pub artifact_id: i64,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    /// Ordered for consumption: (sequence_index, node_key) ascending.
    pub entries: Vec<ContextEntry>,
    /// Sorted independently of entry order, for a stable persisted record.
    pub included_source_node_keys: Vec<String>,
    pub included_artifact_ids: Vec<i64>,
}

fn build(mut entries: Vec<(String, i64, &PhaseArtifact)>) -> AssembledContext {
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut included_source_node_keys: Vec<String> =
        entries.iter().map(|(key, _, _)| key.clone()).collect();
    included_source_node_keys.sort();
    included_source_node_keys.dedup();

    let mut included_artifact_ids: Vec<i64> = entries.iter().map(|(_, _, a)| a.id.get()).collect();
    included_artifact_ids.sort_unstable();

    let entries = entries
        .into_iter()
        .map(|(node_key, sequence_index, artifact)| ContextEntry {
            node_key,
            sequence_index,
            artifact_id: artifact.id.get(),
            body: artifact.body.clone(),
        })
        .collect();

    AssembledContext {
        entries,
        included_source_node_keys,
        included_artifact_ids,
    }
}

impl AssembledContext {
    /// `(node_key, artifact_id)` pairs, one per entry, sorted by node_key.
    /// This is the precise per-source freshness token the rerun cascade
    /// (scheduler step 4) compares against a node's upstream sources on a
    /// later tick, rather than the coarser flat `included_artifact_ids` set.
    pub fn per_source_artifact_ids(&self) -> Vec<(String, i64)> {
        let mut pairs: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|e| (e.node_key.clone(), e.artifact_id))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// The ordinary case: one latest `Output` artifact per direct predecessor.
pub fn assemble_standard_context(sources: &[(String, i64, &PhaseArtifact)]) -> AssembledContext {
    build(sources.iter().map(|(k, s, a)| (k.clone(), *s, *a)).collect())
}

/// Material available to a node reached via a failure edge: the failing
/// node's own failure artifact, plus any `error_handler_summary` artifacts
/// recorded by nodes upstream of it, filtered down to what is new since the
/// last time this target was retargeted (`previous_target_latest_artifact_id`,
/// 0 if never) and tagged for this retarget in particular.
pub fn filter_failure_route_artifacts<'a>(
    candidates: &'a [PhaseArtifact],
    previous_target_latest_artifact_id: i64,
    source_attempt: u32,
    target_attempt: u32,
) -> Vec<&'a PhaseArtifact> {
    candidates
        .iter()
        .filter(|a| a.id.get() > previous_target_latest_artifact_id)
        .filter(|a| {
            let meta_source_attempt = a.metadata.get("source_attempt").and_then(Value::as_u64);
            let meta_target_attempt = a.metadata.get("target_attempt").and_then(Value::as_u64);
            match (meta_source_attempt, meta_target_attempt) {
                (None, None) => true,
                (source, target) => {
                    source.is_none_or(|v| v as u32 == source_attempt)
                        && target.is_none_or(|v| v as u32 == target_attempt)
                }
            }
        })
        .collect()
}

pub fn assemble_failure_route_context(
    failing_node_key: &str,
    failing_sequence_index: i64,
    filtered: &[&PhaseArtifact],
) -> AssembledContext {
    build(
        filtered
            .iter()
            .map(|a| (failing_node_key.to_string(), failing_sequence_index, *a))
            .collect(),
    )
}

/// A join node's context: one entry per child in the selected cohort, keyed
/// by the child's own node_key (not the spawner's), so a join sees each
/// branch's output individually.
pub fn assemble_join_context(cohort: &[(String, i64, &PhaseArtifact)]) -> AssembledContext {
    build(cohort.iter().map(|(k, s, a)| (k.clone(), *s, *a)).collect())
}
