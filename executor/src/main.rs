//! CLI front-end for the executor: a thin `clap` binary exposing
//! `Executor`'s public API as subcommands, with stable exit codes
//! (`exit_codes.rs`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use executor::config::{ExecutorConfig, load_config};
use executor::exit_codes;
use executor::executor::Executor;
use executor::model::artifact::NewArtifact;
use executor::model::ids::{RunId, RunNodeId};
use executor::model::run_node::RunNodeStatus;
use executor::tree_doc::load_tree_document;

#[derive(Parser)]
#[command(name = "executor", version, about = "SQL-backed workflow executor")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, global = true, default_value = "executor.sqlite3")]
    db: PathBuf,

    /// Path to a TOML config file; defaults are used if absent.
    #[arg(long, global = true, default_value = "executor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open (creating if absent) the database and apply the schema.
    InitDb,
    /// Publish a tree document (JSON, see schemas/workflow_tree/v1.schema.json).
    PublishTree {
        /// Path to the tree document.
        file: PathBuf,
    },
    /// Materialize a new run from the latest published version of a tree.
    Launch {
        /// The tree_key to launch.
        tree_key: String,
    },
    /// Run one scheduling step for a run.
    Advance {
        /// The run id.
        run: i64,
    },
    /// Report a provider's outcome for one run-node attempt.
    Report {
        /// The run-node id.
        run_node: i64,
        /// Terminal status: completed, failed, or cancelled.
        status: String,
        /// Path to a JSON file: an array of `{kind, body, metadata}` artifacts.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Cancel a run.
    Cancel {
        /// The run id.
        run: i64,
    },
    /// Print a run's current snapshot as JSON.
    Snapshot {
        /// The run id.
        run: i64,
    },
}

fn main() {
    executor::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::InitDb => cmd_init_db(&cli.db, config),
        Command::PublishTree { file } => cmd_publish_tree(&cli.db, config, &file),
        Command::Launch { tree_key } => cmd_launch(&cli.db, config, &tree_key),
        Command::Advance { run } => cmd_advance(&cli.db, config, RunId(run)),
        Command::Report {
            run_node,
            status,
            artifacts,
        } => cmd_report(&cli.db, config, RunNodeId(run_node), &status, artifacts.as_deref()),
        Command::Cancel { run } => cmd_cancel(&cli.db, config, RunId(run)),
        Command::Snapshot { run } => cmd_snapshot(&cli.db, config, RunId(run)),
    }
}

fn cmd_init_db(db: &Path, config: ExecutorConfig) -> Result<i32> {
    Executor::open(db, config).context("open database")?;
    println!("initialized {}", db.display());
    Ok(exit_codes::OK)
}

fn cmd_publish_tree(db: &Path, config: ExecutorConfig, file: &Path) -> Result<i32> {
    let spec = load_tree_document(file).with_context(|| format!("load tree document {}", file.display()))?;
    let executor = Executor::open(db, config).context("open database")?;
    let tree_id = executor.publish_tree(&spec).context("publish tree")?;
    println!("{}", tree_id.get());
    Ok(exit_codes::OK)
}

fn cmd_launch(db: &Path, config: ExecutorConfig, tree_key: &str) -> Result<i32> {
    let executor = Executor::open(db, config).context("open database")?;
    let run_id = executor.launch_run(tree_key).context("launch run")?;
    println!("{}", run_id.get());
    Ok(exit_codes::OK)
}

fn cmd_advance(db: &Path, config: ExecutorConfig, run_id: RunId) -> Result<i32> {
    let executor = Executor::open(db, config).context("open database")?;
    let report = executor.advance(run_id).context("advance run")?;
    let made_progress = report.nodes_routed > 0 || report.nodes_retried > 0 || report.barriers_released > 0;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "nodes_routed": report.nodes_routed,
            "nodes_retried": report.nodes_retried,
            "barriers_released": report.barriers_released,
            "run_completed": report.run_completed,
            "run_failed": report.run_failed,
        }))?
    );
    if report.run_failed {
        Ok(exit_codes::RUN_FAILED)
    } else if !made_progress && !report.run_completed {
        Ok(exit_codes::NO_OP)
    } else {
        Ok(exit_codes::OK)
    }
}

fn cmd_report(
    db: &Path,
    config: ExecutorConfig,
    run_node_id: RunNodeId,
    status: &str,
    artifacts_file: Option<&Path>,
) -> Result<i32> {
    let status = match status {
        "completed" | "succeeded" => RunNodeStatus::Succeeded,
        "failed" => RunNodeStatus::Failed,
        "cancelled" => RunNodeStatus::Cancelled,
        other => bail!("unrecognized terminal status '{other}' (expected completed, failed, or cancelled)"),
    };
    let artifacts: Vec<NewArtifact> = match artifacts_file {
        None => Vec::new(),
        Some(path) => {
            let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            parse_artifacts(&raw)?
        }
    };
    let executor = Executor::open(db, config).context("open database")?;
    executor
        .report_attempt_result(run_node_id, status, artifacts)
        .context("report attempt result")?;
    Ok(exit_codes::OK)
}

fn parse_artifacts(raw: &str) -> Result<Vec<NewArtifact>> {
    #[derive(serde::Deserialize)]
    struct RawArtifact {
        kind: executor::model::artifact::ArtifactKind,
        #[serde(default)]
        body: serde_json::Value,
        #[serde(default)]
        metadata: serde_json::Value,
    }
    let parsed: Vec<RawArtifact> = serde_json::from_str(raw).context("parse artifacts JSON")?;
    Ok(parsed
        .into_iter()
        .map(|a| NewArtifact {
            kind: a.kind,
            body: a.body,
            metadata: a.metadata,
        })
        .collect())
}

fn cmd_cancel(db: &Path, config: ExecutorConfig, run_id: RunId) -> Result<i32> {
    let executor = Executor::open(db, config).context("open database")?;
    executor.cancel_run(run_id).context("cancel run")?;
    Ok(exit_codes::OK)
}

fn cmd_snapshot(db: &Path, config: ExecutorConfig, run_id: RunId) -> Result<i32> {
    let executor = Executor::open(db, config).context("open database")?;
    let snapshot = executor.get_run_snapshot(run_id).context("load run snapshot")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(exit_codes::OK)
}
