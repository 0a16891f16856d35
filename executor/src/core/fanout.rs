//! Fan-out/join: spawner batch sizing and the join cohort selection rule.

use crate::error::{ExecutorError, Result};
use crate::model::barrier::{BarrierState, JoinBarrier};
use crate::model::ids::RunNodeId;

/// A spawner's plan for its next batch of children, bounded by both the
/// tree node's own `max_children` and the config-level ceiling.
pub fn plan_batch(
    spawner_run_node_id: RunNodeId,
    already_spawned: u32,
    requested: u32,
    max_children: u32,
    ceiling: u32,
) -> Result<u32> {
    let limit = max_children.min(ceiling);
    let remaining = limit.saturating_sub(already_spawned);
    if requested > remaining {
        return Err(ExecutorError::SpawnerOverflow {
            run_node_id: spawner_run_node_id,
            max_children: limit,
        });
    }
    Ok(requested)
}

/// Choose which of a join node's barriers make up the cohort ready to be
/// consumed right now.
///
/// Ordinarily this is every barrier currently `Ready`. But once a batch has
/// been reopened by a late-arriving rerun (a child that failed and was
/// retried after its batch's join had already run), any *already-released*
/// batch below the reopened one is gone for good — rerunning it is not on
/// the table — while any still-open or still-ready batch at or above the
/// reopen point must wait its turn. The cohort rule: the highest
/// `batch_index` that was ever reopened becomes a floor; batches below the
/// floor are skipped even if ready, batches at or above it are included
/// once ready.
pub fn select_join_cohort(barriers: &[JoinBarrier]) -> Vec<&JoinBarrier> {
    // A barrier that was reopened and has since fully released is done for
    // good; it must not keep acting as a floor for batches that arrive
    // long after it was consumed.
    let floor = barriers
        .iter()
        .filter(|b| b.reopened && !matches!(b.state, BarrierState::Released))
        .map(|b| b.batch_index)
        .max();

    match floor {
        None => barriers.iter().filter(|b| b.is_ready()).collect(),
        Some(floor) => barriers
            .iter()
            .filter(|b| b.batch_index >= floor && b.is_ready())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ids::{BarrierId, RunId};

    fn barrier(batch_index: i64, state: BarrierState, reopened: bool, expected: u32, completed: u32) -> JoinBarrier {
        JoinBarrier {
            id: BarrierId(batch_index + 1),
            run_id: RunId(1),
            join_node_key: "join".to_string(),
            spawner_node_key: "spawn".to_string(),
            batch_index,
            expected_count: expected,
            completed_count: completed,
            state,
            reopened,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn plan_batch_rejects_overflow() {
        let err = plan_batch(RunNodeId(1), 10, 5, 12, 12).unwrap_err();
        assert!(matches!(err, ExecutorError::SpawnerOverflow { .. }));
    }

    #[test]
    fn plan_batch_honors_tighter_ceiling() {
        let allowed = plan_batch(RunNodeId(1), 0, 8, 12, 6).unwrap();
        assert_eq!(allowed, 8.min(6));
    }

    #[test]
    fn cohort_without_reopen_is_all_ready_batches() {
        let barriers = vec![
            barrier(0, BarrierState::Ready, false, 2, 2),
            barrier(1, BarrierState::Open, false, 2, 1),
        ];
        let cohort = select_join_cohort(&barriers);
        assert_eq!(cohort.len(), 1);
        assert_eq!(cohort[0].batch_index, 0);
    }

    #[test]
    fn reopened_batch_becomes_floor_skipping_released_batches_below() {
        let barriers = vec![
            barrier(0, BarrierState::Released, false, 2, 2),
            barrier(1, BarrierState::Ready, true, 2, 2),
            barrier(2, BarrierState::Ready, false, 2, 2),
        ];
        let cohort = select_join_cohort(&barriers);
        let indices: Vec<i64> = cohort.iter().map(|b| b.batch_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }
}
