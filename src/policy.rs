//! Run state transition policy.
//!
//! Pure lookup over a fixed table. No state, no locking; safe to call from
//! any task.

use crate::models::RunState;

/// States a run may be proposed into from `current`, in table order.
///
/// `QUEUED -> CANCELING` is listed here but resolves to `CANCELED`, see
/// [`next_state`].
pub fn allowed_targets(current: RunState) -> &'static [RunState] {
    use RunState::*;
    match current {
        Queued => &[Initializing, Canceling, SystemError],
        Initializing => &[
            Running,
            Canceling,
            Canceled,
            ExecutorError,
            SystemError,
            Complete,
        ],
        Canceling => &[Canceled, ExecutorError, SystemError],
        Running => &[SystemError, ExecutorError, Canceled, Canceling, Complete],
        Unknown | Canceled | Complete | ExecutorError | SystemError => &[],
    }
}

/// Resolve the state a run moves into when `proposed` arrives while it is in
/// `current`. Returns `None` when the transition is not allowed.
///
/// A queued run has nothing to cancel gracefully, so a cancel request
/// completes immediately as `CANCELED`.
pub fn next_state(current: RunState, proposed: RunState) -> Option<RunState> {
    if current == RunState::Queued && proposed == RunState::Canceling {
        return Some(RunState::Canceled);
    }
    allowed_targets(current)
        .contains(&proposed)
        .then_some(proposed)
}
