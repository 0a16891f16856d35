//! Executor configuration stored under `<state_dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Executor configuration (TOML).
///
/// Intended to be edited by humans and to remain stable across versions.
/// Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default `max_retries` applied to a tree node when its spec omits one.
    pub max_retries_default: u32,

    /// Upper bound on reload-and-retry attempts when a status transition
    /// loses a compare-and-swap race against another writer.
    pub cas_retry_limit: u32,

    /// Hard ceiling on children a spawner may create across all batches,
    /// independent of any per-node `max_children`.
    pub max_children_ceiling: u32,

    /// Truncate a single artifact body beyond this many bytes before it is
    /// persisted.
    pub artifact_body_limit_bytes: usize,

    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum run nodes advanced in a single `advance()` call before it
    /// returns control to the caller.
    pub max_nodes_per_tick: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_tick: 50,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries_default: 2,
            cas_retry_limit: 5,
            max_children_ceiling: 64,
            artifact_body_limit_bytes: 250_000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cas_retry_limit == 0 {
            return Err(anyhow!("cas_retry_limit must be > 0"));
        }
        if self.max_children_ceiling == 0 {
            return Err(anyhow!("max_children_ceiling must be > 0"));
        }
        if self.artifact_body_limit_bytes == 0 {
            return Err(anyhow!("artifact_body_limit_bytes must be > 0"));
        }
        if self.scheduler.max_nodes_per_tick == 0 {
            return Err(anyhow!("scheduler.max_nodes_per_tick must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExecutorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutorConfig> {
    if !path.exists() {
        let cfg = ExecutorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExecutorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExecutorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
