// error.rs — Fatal scheduler errors
//
// Anything in here aborts the whole compilation pass and is never retried.
// Per-task compile failures are not errors; they are reported through
// `Diagnostic`s in the `CompileReport`.

use crate::id::{NodeId, ScopeId, TaskId, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("node {node} is missing required identity metadata ({missing})")]
    MissingIdentity { node: NodeId, missing: &'static str },

    #[error(
        "worker {worker} received {received} completions with only {outstanding} tasks outstanding"
    )]
    CompletionOverflow {
        worker: WorkerHandle,
        received: usize,
        outstanding: usize,
    },

    #[error("task {task} is not tracked by the current batch")]
    UnknownTask { task: TaskId },

    #[error("task {task} was delivered more than once")]
    DuplicateCompletion { task: TaskId },

    #[error("scope {scope} is not present in the scope group")]
    UnknownScope { scope: ScopeId },

    #[error("node {node} does not exist in the graph")]
    UnknownNode { node: NodeId },

    #[error("scope group verification failed: {failed}")]
    InvalidScopeGroup { failed: String },

    #[error("no scope id left to allocate")]
    ScopeIdExhausted,

    #[error("kernel compiler rejected single-op build of '{name}' ({op_type})")]
    SubmitRejected { name: String, op_type: String },

    #[error("worker {worker} still waiting on {outstanding} tasks after {waited_ms}ms")]
    WaitTimedOut {
        worker: WorkerHandle,
        outstanding: usize,
        waited_ms: u128,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_task() {
        let err = SchedulerError::UnknownTask { task: TaskId(42) };
        assert_eq!(format!("{err}"), "task #42 is not tracked by the current batch");
    }

    #[test]
    fn display_overflow() {
        let err = SchedulerError::CompletionOverflow {
            worker: WorkerHandle(3),
            received: 5,
            outstanding: 2,
        };
        assert_eq!(
            format!("{err}"),
            "worker w3 received 5 completions with only 2 tasks outstanding"
        );
    }
}
