//! Chain execution error set.

use thiserror::Error;

use crate::tasks::errors::TaskError;

/// Failures surfaced by [`crate::chain::ChainExecutor::exec_env`].
///
/// Structural problems (`ChainEmpty`, `Validation`) are reported before any
/// task runs. The rest carry the id of the task that was executing.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The chain has no tasks, or a task id is empty or the reserved `end`.
    #[error("chain has no executable tasks: {0}")]
    ChainEmpty(String),

    /// A structural invariant does not hold.
    #[error("invalid chain definition: {0}")]
    Validation(String),

    /// A referenced input or compose variable was never written.
    #[error("task {task_id}: unknown variable {name:?}")]
    UnknownVariable { task_id: String, name: String },

    /// A prompt, print or output template failed to parse or execute.
    #[error("task {task_id}: template error: {message}")]
    Template { task_id: String, message: String },

    /// No transition branch matched and no default branch exists.
    #[error("task {task_id}: no transition branch matched response {response:?}")]
    TransitionUnresolved { task_id: String, response: String },

    /// Retries exhausted and the task declares no failure branch.
    #[error("task {task_id} failed after {attempts} attempt(s): {source}")]
    TaskFailed {
        task_id: String,
        attempts: u32,
        #[source]
        source: TaskError,
    },

    /// The inspector gate halted execution at a task boundary.
    #[error("breakpoint hit at task {task_id}")]
    BreakpointHit { task_id: String },

    /// The caller's cancellation token fired.
    #[error("chain execution canceled at task {task_id}")]
    Canceled { task_id: String },

    /// Invariant violation inside the executor itself.
    #[error("internal chain error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_task_id() {
        let err = ChainError::UnknownVariable {
            task_id: "score".to_string(),
            name: "prior".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("score"));
        assert!(msg.contains("prior"));
    }
}
