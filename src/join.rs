//! Helpers for joining background tasks on shutdown

use tokio::task::JoinError;

/// Re-raises a panic from a joined task.
///
/// Completion and cancellation (e.g. a task aborted by `Drop`) are both
/// treated as a clean exit.
pub(crate) fn propagate_panics(result: Result<(), JoinError>) {
    let Err(err) = result else {
        return;
    };
    if err.is_cancelled() {
        return;
    }
    match err.try_into_panic() {
        Ok(payload) => std::panic::resume_unwind(payload),
        Err(err) => panic!("Unexpected join error (other than panic or cancellation): {err}"),
    }
}
