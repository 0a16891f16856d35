//! Upstream context assembly driven end-to-end through a real
//! [`executor::scheduler::Scheduler`] and [`executor::store::Store`],
//! exercising the freshness / failure-route rules: noise immunity, stale
//! failure-route suppression on a later success refresh, and
//! retry-summary scoping to the current failure cycle.

use executor::config::ExecutorConfig;
use executor::model::artifact::{ArtifactKind, METADATA_KIND_FAILED_COMMAND_OUTPUT};
use executor::model::run_node::RunNodeStatus;
use executor::model::tree::{NodeRole, NodeType, RouteOn, TreeEdgeSpec, TreeNodeSpec, WorkflowTreeSpec};
use executor::scheduler::Scheduler;
use executor::store::Store;
use serde_json::json;

fn node(key: &str, sequence_index: i64, max_retries: u32) -> TreeNodeSpec {
    TreeNodeSpec {
        node_key: key.to_string(),
        node_type: NodeType::Agent,
        node_role: NodeRole::Standard,
        provider: None,
        model: None,
        prompt_template: None,
        max_retries,
        max_children: 12,
        sequence_index,
    }
}

fn auto_edge(source: &str, target: &str, route_on: RouteOn, priority: i64) -> TreeEdgeSpec {
    TreeEdgeSpec {
        source_node_key: source.to_string(),
        target_node_key: target.to_string(),
        route_on,
        priority,
        auto: true,
        guard_expression: None,
    }
}

/// A `failed_command_output`-flagged log is noise: it must
/// neither feed a successor's context nor trigger the rerun cascade even
/// though it is, numerically, the freshest artifact on its node.
#[test]
fn noise_artifacts_never_feed_context_or_invalidate_freshness() {
    let store = Store::open_in_memory().expect("store");
    let config = ExecutorConfig::default();
    let spec = WorkflowTreeSpec {
        tree_key: "noise-immune".to_string(),
        version: 1,
        description: None,
        nodes: vec![node("upstream", 0, 0), node("downstream", 1, 0)],
        edges: vec![auto_edge("upstream", "downstream", RouteOn::Success, 0)],
    };
    let tree_id = store.publish_tree(&spec).expect("publish");
    let run_id = store.create_run(tree_id).expect("create run");
    store
        .create_root_run_node_with_status(run_id, "upstream", RunNodeStatus::Pending)
        .expect("materialize upstream");

    let scheduler = Scheduler::new(&store, &config);
    let upstream = store.load_latest_attempt(run_id, "upstream").unwrap().unwrap();
    let output_artifact_id = store
        .insert_artifact(
            run_id,
            upstream.id,
            "upstream",
            upstream.attempt_number,
            ArtifactKind::Output,
            0,
            &json!({"report": "v1"}),
            &json!({}),
        )
        .unwrap();
    store
        .transition_run_node_status(upstream.id, upstream.version, RunNodeStatus::Succeeded)
        .unwrap();
    scheduler.advance(run_id).expect("advance 1");

    let downstream = store.load_latest_attempt(run_id, "downstream").unwrap().expect("routed");
    let manifest = store
        .load_attempt_manifest(downstream.id, downstream.attempt_number)
        .unwrap()
        .expect("manifest");
    assert_eq!(
        manifest.per_source_artifact_ids,
        vec![("upstream".to_string(), output_artifact_id.get())]
    );

    // A noisy tool log lands after the routed artifact; higher id, but
    // tagged `failed_command_output`.
    store
        .insert_artifact(
            run_id,
            upstream.id,
            "upstream",
            upstream.attempt_number,
            ArtifactKind::Log,
            1,
            &json!("stderr: retrying connection"),
            &json!({"kind": METADATA_KIND_FAILED_COMMAND_OUTPUT}),
        )
        .unwrap();

    scheduler.advance(run_id).expect("advance 2 — noise must not trigger a rerun");

    let downstream_after = store.load_latest_attempt(run_id, "downstream").unwrap().unwrap();
    assert_eq!(
        downstream_after.attempt_number, 1,
        "a noise artifact must never look fresher and trigger the rerun cascade"
    );
}

/// `target` is reachable from both a success predecessor and
/// a failure predecessor. When the success predecessor's routing resolves
/// first, the target's first attempt carries only the success-route
/// context; once that predecessor later produces a fresher artifact, the
/// rerun cascade reassembles the target's next attempt from that refresh
/// alone, never smuggling in the stale failure-route material.
#[test]
fn stale_failure_route_context_is_suppressed_on_a_later_success_refresh() {
    let store = Store::open_in_memory().expect("store");
    let config = ExecutorConfig::default();
    let spec = WorkflowTreeSpec {
        tree_key: "s2".to_string(),
        version: 1,
        description: None,
        // Node keys are chosen so that, within one `advance()` tick, the
        // success predecessor sorts (and so is processed) before the
        // failure predecessor, letting the success route win the race to
        // materialize `target`'s first attempt.
        nodes: vec![node("source_approval", 0, 0), node("source_incident", 0, 0), node("target", 1, 0)],
        edges: vec![
            auto_edge("source_approval", "target", RouteOn::Success, 0),
            auto_edge("source_incident", "target", RouteOn::Failure, 0),
        ],
    };
    let tree_id = store.publish_tree(&spec).expect("publish");
    let run_id = store.create_run(tree_id).expect("create run");
    store
        .create_root_run_node_with_status(run_id, "source_approval", RunNodeStatus::Pending)
        .expect("materialize source_approval");
    store
        .create_root_run_node_with_status(run_id, "source_incident", RunNodeStatus::Pending)
        .expect("materialize source_incident");

    let scheduler = Scheduler::new(&store, &config);
    let approval = store.load_latest_attempt(run_id, "source_approval").unwrap().unwrap();
    let incident = store.load_latest_attempt(run_id, "source_incident").unwrap().unwrap();

    store
        .insert_artifact(run_id, incident.id, "source_incident", 1, ArtifactKind::Failure, 0, &json!({"error": "timeout"}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(incident.id, incident.version, RunNodeStatus::Failed)
        .unwrap();
    store
        .insert_artifact(run_id, approval.id, "source_approval", 1, ArtifactKind::Output, 0, &json!({"decision": "approved"}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(approval.id, approval.version, RunNodeStatus::Succeeded)
        .unwrap();

    scheduler.advance(run_id).expect("advance 1");

    let target = store.load_latest_attempt(run_id, "target").unwrap().expect("target materialized");
    assert_eq!(target.attempt_number, 1);
    let manifest_1 = store.load_attempt_manifest(target.id, target.attempt_number).unwrap().expect("manifest");
    assert!(
        !manifest_1.failure_route_context_included,
        "the success predecessor reached `target` first; the failure route must find it already in flight"
    );
    assert_eq!(manifest_1.included_source_node_keys, vec!["source_approval".to_string()]);

    store
        .insert_artifact(run_id, target.id, "target", target.attempt_number, ArtifactKind::Output, 0, &json!({"ok": true}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(target.id, target.version, RunNodeStatus::Succeeded)
        .unwrap();
    scheduler.advance(run_id).expect("advance 2 — target records its own (absent) routing decision");

    // `source_approval` is "re-run": a fresher artifact lands for the same
    // attempt, without the node itself changing status.
    store
        .insert_artifact(run_id, approval.id, "source_approval", 1, ArtifactKind::Output, 1, &json!({"decision": "approved", "revision": 2}), &json!({}))
        .unwrap();

    scheduler.advance(run_id).expect("advance 3 — rerun cascade reassembles target attempt 2");

    let target_attempt_2 = store.load_latest_attempt(run_id, "target").unwrap().unwrap();
    assert_eq!(target_attempt_2.attempt_number, 2, "staleness against source_approval's fresher artifact triggers a new attempt");
    let manifest_2 = store
        .load_attempt_manifest(target_attempt_2.id, target_attempt_2.attempt_number)
        .unwrap()
        .expect("manifest");
    assert!(
        !manifest_2.failure_route_context_included,
        "a rerun-cascade attempt is never reached via a failure edge"
    );
    assert_eq!(manifest_2.included_source_node_keys, vec!["source_approval".to_string()]);
}

/// A failure cycle's retry-summary lookup only considers
/// `error_handler_summary` artifacts newer than the target's previous
/// latest artifact. A stale summary left over from a target attempt that
/// already ran to completion must not leak into the next failure-route
/// assembly even when its `source_attempt`/`target_attempt` tags happen to
/// match.
#[test]
fn retry_summary_from_a_finished_cycle_does_not_leak_into_the_next() {
    let store = Store::open_in_memory().expect("store");
    let config = ExecutorConfig::default();
    let spec = WorkflowTreeSpec {
        tree_key: "s3".to_string(),
        version: 1,
        description: None,
        nodes: vec![node("helper", 0, 0), node("source", 0, 2), node("target", 1, 0)],
        edges: vec![
            auto_edge("helper", "target", RouteOn::Success, 0),
            auto_edge("source", "target", RouteOn::Failure, 0),
        ],
    };
    let tree_id = store.publish_tree(&spec).expect("publish");
    let run_id = store.create_run(tree_id).expect("create run");
    store
        .create_root_run_node_with_status(run_id, "helper", RunNodeStatus::Pending)
        .expect("materialize helper");
    store
        .create_root_run_node_with_status(run_id, "source", RunNodeStatus::Pending)
        .expect("materialize source");

    let scheduler = Scheduler::new(&store, &config);
    let source_attempt_1 = store.load_latest_attempt(run_id, "source").unwrap().unwrap();

    // source fails once (attempt 1 of 3 allowed, max_retries = 2): retried
    // silently, no routing touches `target` yet.
    store
        .insert_artifact(run_id, source_attempt_1.id, "source", 1, ArtifactKind::Failure, 0, &json!({"error": "a1"}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(source_attempt_1.id, source_attempt_1.version, RunNodeStatus::Failed)
        .unwrap();
    scheduler.advance(run_id).expect("advance: silent retry 1->2");
    let source_attempt_2 = store.load_latest_attempt(run_id, "source").unwrap().unwrap();
    assert_eq!(source_attempt_2.attempt_number, 2);

    // A stale error_handler_summary from a long-gone cycle, tagged for
    // exactly (source_attempt=1, target_attempt=2) — the pairing this test
    // will later reach, but it must not survive the freshness filter.
    store
        .insert_artifact(
            run_id,
            source_attempt_1.id,
            "source",
            1,
            ArtifactKind::ErrorHandlerSummary,
            0,
            &json!({"summary": "stale"}),
            &json!({"source_attempt": 1, "target_attempt": 2}),
        )
        .unwrap();

    // `helper` completes and routes to `target`, which runs once and
    // finishes — this is the artifact the freshness filter must treat as
    // the watermark for "current" failure-cycle material.
    store
        .insert_artifact(
            run_id,
            store.load_latest_attempt(run_id, "helper").unwrap().unwrap().id,
            "helper",
            1,
            ArtifactKind::Output,
            0,
            &json!({}),
            &json!({}),
        )
        .unwrap();
    let helper = store.load_latest_attempt(run_id, "helper").unwrap().unwrap();
    store
        .transition_run_node_status(helper.id, helper.version, RunNodeStatus::Succeeded)
        .unwrap();
    scheduler.advance(run_id).expect("advance: helper routes target attempt 1");
    let target_attempt_1 = store.load_latest_attempt(run_id, "target").unwrap().expect("target materialized via helper");
    store
        .insert_artifact(run_id, target_attempt_1.id, "target", 1, ArtifactKind::Output, 0, &json!({}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(target_attempt_1.id, target_attempt_1.version, RunNodeStatus::Succeeded)
        .unwrap();
    scheduler.advance(run_id).expect("advance: target attempt 1 records its own routing decision");

    // `source` fails two more times (attempt 2, then attempt 3), exhausting
    // its retries on the third, and its failure route finally fires.
    store
        .insert_artifact(run_id, source_attempt_2.id, "source", 2, ArtifactKind::Failure, 0, &json!({"error": "a2"}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(source_attempt_2.id, source_attempt_2.version, RunNodeStatus::Failed)
        .unwrap();
    scheduler.advance(run_id).expect("advance: silent retry 2->3");
    let source_attempt_3 = store.load_latest_attempt(run_id, "source").unwrap().unwrap();
    assert_eq!(source_attempt_3.attempt_number, 3);

    store
        .insert_artifact(run_id, source_attempt_3.id, "source", 3, ArtifactKind::Failure, 0, &json!({"error": "a3 final"}), &json!({}))
        .unwrap();
    store
        .transition_run_node_status(source_attempt_3.id, source_attempt_3.version, RunNodeStatus::Failed)
        .unwrap();
    scheduler.advance(run_id).expect("advance: retries exhausted, failure route fires");

    let target_attempt_2 = store.load_latest_attempt(run_id, "target").unwrap().unwrap();
    assert_eq!(target_attempt_2.attempt_number, 2, "exhausted source must retarget target's next attempt");
    let manifest = store
        .load_attempt_manifest(target_attempt_2.id, target_attempt_2.attempt_number)
        .unwrap()
        .expect("manifest");
    assert!(manifest.failure_route_context_included);
    let final_failure_id = store
        .load_artifacts_for_node(run_id, "source")
        .unwrap()
        .into_iter()
        .filter(|a| matches!(a.kind, ArtifactKind::Failure))
        .map(|a| a.id.get())
        .max()
        .unwrap();
    assert_eq!(manifest.failure_route_failure_artifact_id, Some(final_failure_id));
    assert_eq!(
        manifest.failure_route_retry_summary_artifact_id, None,
        "the stale summary from the already-finished first cycle must not leak into this one"
    );
}
