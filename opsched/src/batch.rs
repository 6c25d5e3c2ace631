// batch.rs — Per-round compile bookkeeping
//
// A `CompileBatch` is the transient state of one dispatch round: which tasks
// were issued, which scope each belongs to, which tasks make up a slice
// scope, and the succeeded/failed buckets filled by the poller.
//
// Preconditions: task ids registered here come from one `IdAllocator`.
// Postconditions: once `outstanding() == 0`,
//                 `succeeded().len() + failed().len() == total_issued()`.
// Failure modes: unknown or duplicate task ids → fatal `SchedulerError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::id::{ScopeId, TaskId, WorkerHandle};
use crate::options::CompileStrategy;

// ── Tasks and outcomes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Normal,
    Slice { index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileTask {
    pub task_id: TaskId,
    pub scope_id: ScopeId,
    pub kind: TaskKind,
    pub strategy: CompileStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

/// Compiler-produced metadata attached to the nodes of a compiled scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompileMetadata {
    #[serde(default)]
    pub kernel_path: Option<String>,
    #[serde(default)]
    pub compile_info_json: Option<String>,
    #[serde(default)]
    pub compile_info_key: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: CompileMetadata,
}

impl TaskOutcome {
    pub fn succeeded(task_id: TaskId, metadata: CompileMetadata) -> Self {
        TaskOutcome {
            task_id,
            status: TaskStatus::Succeeded,
            metadata,
        }
    }

    pub fn failed(task_id: TaskId) -> Self {
        TaskOutcome {
            task_id,
            status: TaskStatus::Failed,
            metadata: CompileMetadata::default(),
        }
    }
}

// ── Batch ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompileBatch {
    worker: WorkerHandle,
    tasks: BTreeMap<TaskId, CompileTask>,
    /// Tasks of slice scopes, in submission order.
    scope_tasks: BTreeMap<ScopeId, Vec<TaskId>>,
    outstanding: usize,
    total_issued: usize,
    succeeded: BTreeMap<TaskId, TaskOutcome>,
    failed: BTreeMap<TaskId, TaskOutcome>,
    /// Tasks refused at submit time; never delivered by `poll`.
    rejected: BTreeSet<TaskId>,
    /// Slice scopes whose failure already triggered one de-fusion attempt.
    deletion_attempted: BTreeSet<ScopeId>,
    /// Slice scopes with a slice the compiler never queued.
    unqueued_slices: BTreeSet<ScopeId>,
}

impl CompileBatch {
    pub fn new(worker: WorkerHandle) -> Self {
        CompileBatch {
            worker,
            tasks: BTreeMap::new(),
            scope_tasks: BTreeMap::new(),
            outstanding: 0,
            total_issued: 0,
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
            rejected: BTreeSet::new(),
            deletion_attempted: BTreeSet::new(),
            unqueued_slices: BTreeSet::new(),
        }
    }

    /// A fresh round that remembers which slice scopes were already retried.
    pub fn continuing(worker: WorkerHandle, attempted: &BTreeSet<ScopeId>) -> Self {
        let mut batch = Self::new(worker);
        batch.deletion_attempted = attempted.clone();
        batch
    }

    pub fn worker(&self) -> WorkerHandle {
        self.worker
    }

    /// Track a task the compiler accepted.
    pub fn register(&mut self, task: CompileTask) {
        self.track(task);
        self.outstanding += 1;
    }

    /// Track a task the compiler refused outright. It lands in the failed
    /// bucket immediately and is never waited on.
    pub fn record_rejected(&mut self, task: CompileTask) {
        self.track(task);
        self.rejected.insert(task.task_id);
        self.failed
            .insert(task.task_id, TaskOutcome::failed(task.task_id));
    }

    pub fn was_rejected(&self, task: TaskId) -> bool {
        self.rejected.contains(&task)
    }

    fn track(&mut self, task: CompileTask) {
        self.total_issued += 1;
        if let TaskKind::Slice { .. } = task.kind {
            self.scope_tasks
                .entry(task.scope_id)
                .or_default()
                .push(task.task_id);
        }
        self.tasks.insert(task.task_id, task);
    }

    /// A slice of `scope` was answered without queueing a task, so the
    /// scope's slice set can never be complete.
    pub fn record_unqueued_slice(&mut self, scope: ScopeId) {
        self.unqueued_slices.insert(scope);
    }

    pub fn has_unqueued_slice(&self, scope: ScopeId) -> bool {
        self.unqueued_slices.contains(&scope)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn total_issued(&self) -> usize {
        self.total_issued
    }

    pub fn task(&self, task: TaskId) -> Result<&CompileTask, SchedulerError> {
        self.tasks.get(&task).ok_or(SchedulerError::UnknownTask { task })
    }

    pub fn scope_of(&self, task: TaskId) -> Result<ScopeId, SchedulerError> {
        Ok(self.task(task)?.scope_id)
    }

    /// Slice tasks recorded for `scope` (empty for ordinary scopes).
    pub fn slice_tasks(&self, scope: ScopeId) -> &[TaskId] {
        self.scope_tasks.get(&scope).map_or(&[], Vec::as_slice)
    }

    /// A scope counts as a slice scope only when it produced more than one
    /// task; a single-slice scope is handled like an ordinary one.
    pub fn is_slice_scope(&self, scope: ScopeId) -> bool {
        self.slice_tasks(scope).len() > 1
    }

    /// Put one completion in its bucket.
    pub fn bucket(&mut self, outcome: TaskOutcome) -> Result<(), SchedulerError> {
        let task = outcome.task_id;
        self.task(task)?;
        if self.succeeded.contains_key(&task) || self.failed.contains_key(&task) {
            return Err(SchedulerError::DuplicateCompletion { task });
        }
        match outcome.status {
            TaskStatus::Succeeded => self.succeeded.insert(task, outcome),
            TaskStatus::Failed => self.failed.insert(task, outcome),
        };
        self.outstanding -= 1;
        Ok(())
    }

    pub fn succeeded(&self) -> &BTreeMap<TaskId, TaskOutcome> {
        &self.succeeded
    }

    pub fn failed(&self) -> &BTreeMap<TaskId, TaskOutcome> {
        &self.failed
    }

    pub fn take_succeeded(&mut self, task: TaskId) -> Option<TaskOutcome> {
        self.succeeded.remove(&task)
    }

    /// Move a succeeded task into the failed bucket.
    pub fn demote_success(&mut self, task: TaskId) {
        if let Some(outcome) = self.succeeded.remove(&task) {
            self.failed.insert(
                task,
                TaskOutcome {
                    status: TaskStatus::Failed,
                    ..outcome
                },
            );
        }
    }

    /// Drop every failed task of `scope` from the failure set.
    pub fn clear_failures_of(&mut self, scope: ScopeId) {
        let tasks = &self.tasks;
        self.failed
            .retain(|task, _| tasks.get(task).map(|t| t.scope_id) != Some(scope));
    }

    /// Distinct scopes with at least one failed task, in task id order.
    pub fn failed_scopes(&self) -> Result<Vec<ScopeId>, SchedulerError> {
        let mut scopes = Vec::new();
        for task in self.failed.keys() {
            let scope = self.scope_of(*task)?;
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        Ok(scopes)
    }

    /// Mark a slice scope as retried. Returns false if it already was.
    pub fn mark_deletion_attempted(&mut self, scope: ScopeId) -> bool {
        self.deletion_attempted.insert(scope)
    }

    pub fn deletion_attempted(&self) -> &BTreeSet<ScopeId> {
        &self.deletion_attempted
    }
}
