//! The structured subtask list a spawner's terminal artifact carries in its
//! `metadata.subtasks` field, materialized by the fan-out subsystem into
//! fresh child run nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub node_key: String,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}
