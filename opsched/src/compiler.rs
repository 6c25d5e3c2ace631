// compiler.rs — Call surface of the external kernel compiler
//
// The kernel compiler is a black box with its own worker pool. The scheduler
// submits requests tagged with a task id and a worker handle, then polls the
// same handle for completions. Submission is synchronous and only reports
// whether the request was accepted; the build outcome arrives through `poll`.

use crate::batch::TaskOutcome;
use crate::graph::Node;
use crate::id::{ScopeId, TaskId, WorkerHandle};
use crate::options::CompileStrategy;

/// Immediate answer of a submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildCode {
    /// Queued; the outcome will be delivered by `poll`.
    Accepted,
    /// Hard build failure; nothing was queued.
    Rejected,
    /// The op cannot be built for dynamic shapes; nothing was queued.
    DynamicShapeUnsupported,
}

/// One build request: the nodes of a scope plus how to build them.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub task_id: TaskId,
    pub scope_id: ScopeId,
    pub worker: WorkerHandle,
    pub strategy: CompileStrategy,
    pub nodes: Vec<&'a Node>,
}

pub trait KernelCompiler {
    /// Ordinary build of a whole scope.
    fn submit(&self, request: &CompileRequest<'_>) -> BuildCode;

    /// Build of one thread slice of a scope.
    fn submit_slice(&self, request: &CompileRequest<'_>, slice_index: u32) -> BuildCode;

    /// Shape-generalized build of a single op.
    fn submit_fuzzy(&self, request: &CompileRequest<'_>) -> BuildCode;

    /// Non-blocking. An empty result means nothing has finished yet.
    fn poll(&self, worker: WorkerHandle) -> Vec<TaskOutcome>;
}

impl<T: KernelCompiler + ?Sized> KernelCompiler for &T {
    fn submit(&self, request: &CompileRequest<'_>) -> BuildCode {
        (**self).submit(request)
    }

    fn submit_slice(&self, request: &CompileRequest<'_>, slice_index: u32) -> BuildCode {
        (**self).submit_slice(request, slice_index)
    }

    fn submit_fuzzy(&self, request: &CompileRequest<'_>) -> BuildCode {
        (**self).submit_fuzzy(request)
    }

    fn poll(&self, worker: WorkerHandle) -> Vec<TaskOutcome> {
        (**self).poll(worker)
    }
}

impl<T: KernelCompiler + ?Sized> KernelCompiler for std::sync::Arc<T> {
    fn submit(&self, request: &CompileRequest<'_>) -> BuildCode {
        (**self).submit(request)
    }

    fn submit_slice(&self, request: &CompileRequest<'_>, slice_index: u32) -> BuildCode {
        (**self).submit_slice(request, slice_index)
    }

    fn submit_fuzzy(&self, request: &CompileRequest<'_>) -> BuildCode {
        (**self).submit_fuzzy(request)
    }

    fn poll(&self, worker: WorkerHandle) -> Vec<TaskOutcome> {
        (**self).poll(worker)
    }
}
