//! The run-node state machine: the legal transitions a single attempt can
//! make, independent of how the scheduler decides to trigger them.

use crate::error::{ExecutorError, Result};
use crate::model::ids::RunNodeId;
use crate::model::run_node::{RunNode, RunNodeStatus};

/// An external event driving a run node's attempt forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Started,
    Succeeded,
    Failed,
    /// The node's join barrier has reached `Ready` (and been released); an
    /// `AwaitingJoin` node becomes an ordinary `Pending` attempt.
    BarrierSatisfied,
    Skipped,
    /// The owning run was cancelled. Legal from any non-terminal status;
    /// cancellation is final and produces no further attempts.
    Cancelled,
}

/// Validate and compute the next status for a run node given an event.
/// Does not touch the store; callers persist the result via a
/// compare-and-swap transition keyed on the node's current `version`.
pub fn next_status(current: RunNodeStatus, event: AttemptEvent) -> Result<RunNodeStatus> {
    use AttemptEvent::*;
    use RunNodeStatus::*;

    let next = match (current, event) {
        (Pending, Started) => Running,
        (Running, Succeeded) => Succeeded,
        (Running, Failed) => Failed,
        // A join's first attempt is materialized `AwaitingJoin` at launch;
        // once its cohort barrier is satisfied it becomes an ordinary
        // `Pending` attempt for the external dispatcher to pick up, same as
        // any other node.
        (AwaitingJoin, BarrierSatisfied) => Pending,
        (Pending, Skipped) => Skipped,
        (Pending, Cancelled) | (Running, Cancelled) | (AwaitingJoin, Cancelled) => Cancelled,
        (current, event) => {
            return Err(ExecutorError::Corrupt(format!(
                "illegal transition: {current:?} + {event:?}"
            )));
        }
    };
    Ok(next)
}

/// Whether a failed attempt may retry (a fresh attempt row, not a status
/// change on this one): the node's tree-node `max_retries` bounds how many
/// additional attempts beyond the first are allowed.
pub fn may_retry(node: &RunNode, max_retries: u32) -> bool {
    matches!(node.status, RunNodeStatus::Failed) && node.retries_used() < max_retries
}

/// A run node that has exhausted its retries and must route on failure.
pub fn attempt_limit_error(node: &RunNode, max_retries: u32) -> ExecutorError {
    ExecutorError::AttemptLimitExceeded {
        run_node_id: node.id,
        max_retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_starts_to_running() {
        assert_eq!(
            next_status(RunNodeStatus::Pending, AttemptEvent::Started).unwrap(),
            RunNodeStatus::Running
        );
    }

    #[test]
    fn running_succeeds_or_fails() {
        assert_eq!(
            next_status(RunNodeStatus::Running, AttemptEvent::Succeeded).unwrap(),
            RunNodeStatus::Succeeded
        );
        assert_eq!(
            next_status(RunNodeStatus::Running, AttemptEvent::Failed).unwrap(),
            RunNodeStatus::Failed
        );
    }

    #[test]
    fn succeeded_is_terminal() {
        assert!(next_status(RunNodeStatus::Succeeded, AttemptEvent::Started).is_err());
    }

    #[test]
    fn barrier_satisfied_moves_awaiting_join_to_pending() {
        assert_eq!(
            next_status(RunNodeStatus::AwaitingJoin, AttemptEvent::BarrierSatisfied).unwrap(),
            RunNodeStatus::Pending
        );
    }

    #[test]
    fn cancellation_is_legal_from_pending_and_running() {
        assert_eq!(
            next_status(RunNodeStatus::Pending, AttemptEvent::Cancelled).unwrap(),
            RunNodeStatus::Cancelled
        );
        assert_eq!(
            next_status(RunNodeStatus::Running, AttemptEvent::Cancelled).unwrap(),
            RunNodeStatus::Cancelled
        );
    }

    #[test]
    fn cancellation_is_final() {
        assert!(next_status(RunNodeStatus::Cancelled, AttemptEvent::Started).is_err());
    }

    #[test]
    fn retry_bound_respects_max_retries() {
        let node = RunNode {
            id: RunNodeId(1),
            run_id: crate::model::ids::RunId(1),
            node_key: "n".to_string(),
            attempt_number: 3,
            status: RunNodeStatus::Failed,
            version: 1,
            parent_run_node_id: None,
            batch_index: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!may_retry(&node, 1));
        assert!(may_retry(&node, 5));
    }
}
