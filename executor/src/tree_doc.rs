//! Tree document load/save: JSON Schema validation plus the cross-field
//! invariants `WorkflowTreeSpec::validate` cannot express as schema.
//!
//! Schema validation catches shape errors (missing fields, wrong enum
//! values) while the semantic pass catches graph-level ones (duplicate
//! keys, dangling edges, the auto/guard and failure/auto coupling a
//! published tree must satisfy).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::model::tree::WorkflowTreeSpec;

const V1_SCHEMA: &str = include_str!("../schemas/workflow_tree/v1.schema.json");

/// Load and validate a tree document from disk: JSON Schema, then the
/// graph-level semantic invariants.
pub fn load_tree_document(path: &Path) -> Result<WorkflowTreeSpec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read tree document {}", path.display()))?;
    parse_tree_document(&contents).with_context(|| format!("load {}", path.display()))
}

pub fn parse_tree_document(contents: &str) -> Result<WorkflowTreeSpec> {
    let value: Value = serde_json::from_str(contents).context("parse tree document as JSON")?;
    validate_schema(&value)?;
    let spec: WorkflowTreeSpec =
        serde_json::from_value(value).context("deserialize tree document")?;
    let errors = spec.validate();
    if !errors.is_empty() {
        return Err(anyhow!("tree invariants failed: {}", errors.join("; ")));
    }
    Ok(spec)
}

fn validate_schema(doc: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(V1_SCHEMA).expect("embedded schema is valid JSON");
    let compiled = validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if !compiled.is_valid(doc) {
        let messages: Vec<String> = compiled.iter_errors(doc).map(|err| err.to_string()).collect();
        return Err(anyhow!("tree schema validation failed: {}", messages.join("; ")));
    }
    Ok(())
}
