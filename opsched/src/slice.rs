// slice.rs — Thread-slice compilation
//
// A scope whose first node carries auto-thread slice metadata is compiled
// per slice instead of as a whole. Interior slices are shape-congruent, so
// only the first and last slice are submitted. The resulting task ids form
// a set: the scope succeeds only when every task of the set succeeded, and
// one failed slice takes the whole set out of the success bucket.
//
// Preconditions: all nodes of a slice scope carry slice metadata with the
//                same slice count as the first node.
// Postconditions: node names are the originals after every submission,
//                 whatever the compiler answered.
// Failure modes: unknown nodes (fatal).
// Side effects: rewrites `slice_shape` of input/output tensors; renames
//               nodes for the duration of each submit call.

use crate::batch::{CompileBatch, CompileTask, TaskKind, TaskOutcome};
use crate::diag::Diagnostic;
use crate::dispatch::{DispatchMode, TaskDispatcher};
use crate::error::SchedulerError;
use crate::graph::{FusionOrigin, Graph};
use crate::id::{NodeId, ScopeId, TaskId};
use crate::options::CompileStrategy;

/// Appended to node names while one slice is being submitted, so the
/// compiler's per-node caches never collide across slices.
pub const SLICE_NAME_SUFFIX: &str = "__thread_slice_";

/// Slices actually compiled for a scope with `count` slices.
pub fn representative_slices(count: usize) -> Vec<u32> {
    match count {
        0 => Vec::new(),
        1 => vec![0],
        n => vec![0, (n - 1) as u32],
    }
}

pub struct SliceTaskCoordinator<'d, 'c> {
    dispatcher: &'d TaskDispatcher<'c>,
}

impl<'d, 'c> SliceTaskCoordinator<'d, 'c> {
    pub fn new(dispatcher: &'d TaskDispatcher<'c>) -> Self {
        SliceTaskCoordinator { dispatcher }
    }

    /// True when the scope's first node asks for auto-thread slicing.
    pub fn applies(graph: &Graph, nodes: &[NodeId]) -> Result<bool, SchedulerError> {
        match nodes.first() {
            Some(first) => Ok(graph.node(*first)?.has_auto_thread_slices()),
            None => Ok(false),
        }
    }

    /// Submit the representative slices of one scope.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_sliced(
        &self,
        graph: &mut Graph,
        scope: ScopeId,
        nodes: &[NodeId],
        strategy: CompileStrategy,
        mode: DispatchMode,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Vec<TaskId>, SchedulerError> {
        clear_slice_shapes(graph, nodes)?;

        let count = match nodes.first() {
            Some(first) => graph
                .node(*first)?
                .slice
                .as_ref()
                .map_or(0, |s| s.slice_count()),
            None => 0,
        };
        let indices = representative_slices(count);
        if indices.is_empty() {
            let task = self
                .dispatcher
                .submit(graph, scope, nodes, strategy, mode, batch, diags)?;
            return Ok(task.into_iter().collect());
        }

        let mut tasks = Vec::with_capacity(indices.len());
        for index in indices {
            apply_slice_shapes(graph, nodes, index as usize)?;
            let originals = rename_for_slice(graph, nodes, index)?;
            let task_id = self.dispatcher.next_task_id();
            let code = self
                .dispatcher
                .request(graph, task_id, scope, batch.worker(), strategy, nodes)
                .map(|request| self.dispatcher.compiler().submit_slice(&request, index));
            restore_names(graph, nodes, originals)?;
            let code = code?;

            let task = CompileTask {
                task_id,
                scope_id: scope,
                kind: TaskKind::Slice { index },
                strategy,
            };
            if let Some(id) = self
                .dispatcher
                .settle(graph, task, nodes, code, mode, batch, diags)?
            {
                tasks.push(id);
            }
        }
        Ok(tasks)
    }
}

fn clear_slice_shapes(graph: &mut Graph, nodes: &[NodeId]) -> Result<(), SchedulerError> {
    for id in nodes {
        let node = graph.node_mut(*id)?;
        for tensor in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
            tensor.slice_shape = None;
        }
    }
    Ok(())
}

fn apply_slice_shapes(
    graph: &mut Graph,
    nodes: &[NodeId],
    index: usize,
) -> Result<(), SchedulerError> {
    for id in nodes {
        let node = graph.node_mut(*id)?;
        let Some(slice) = node.slice.as_ref() else {
            continue;
        };
        let inputs = slice.input_ranges.get(index).cloned().unwrap_or_default();
        let outputs = slice.output_ranges.get(index).cloned().unwrap_or_default();
        for (tensor, range) in node.inputs.iter_mut().zip(inputs) {
            tensor.slice_shape = Some(range.extent);
        }
        for (tensor, range) in node.outputs.iter_mut().zip(outputs) {
            tensor.slice_shape = Some(range.extent);
        }
    }
    Ok(())
}

fn rename_for_slice(
    graph: &mut Graph,
    nodes: &[NodeId],
    index: u32,
) -> Result<Vec<String>, SchedulerError> {
    let mut originals = Vec::with_capacity(nodes.len());
    for id in nodes {
        let node = graph.node_mut(*id)?;
        let renamed = format!("{}{}{}", node.name, SLICE_NAME_SUFFIX, index);
        originals.push(std::mem::replace(&mut node.name, renamed));
    }
    Ok(originals)
}

fn restore_names(
    graph: &mut Graph,
    nodes: &[NodeId],
    originals: Vec<String>,
) -> Result<(), SchedulerError> {
    for (id, name) in nodes.iter().zip(originals) {
        graph.node_mut(*id)?.name = name;
    }
    Ok(())
}

// ── Outcome accounting ──────────────────────────────────────────────────────

/// Move the successes of every slice scope with a failed slice into the
/// failed bucket. Returns the affected scopes.
pub fn purge_partial_successes(batch: &mut CompileBatch) -> Result<Vec<ScopeId>, SchedulerError> {
    let mut purged = Vec::new();
    for scope in batch.failed_scopes()? {
        let tasks = batch.slice_tasks(scope).to_vec();
        if tasks.is_empty() {
            continue;
        }
        for task in tasks {
            batch.demote_success(task);
        }
        purged.push(scope);
    }
    Ok(purged)
}

/// Take the full slice set of `scope` out of the success bucket, ordered by
/// slice index, if every task of the set succeeded. A set with an unqueued
/// slice is never complete.
pub fn take_complete_set(batch: &mut CompileBatch, scope: ScopeId) -> Option<Vec<TaskOutcome>> {
    let tasks = batch.slice_tasks(scope).to_vec();
    if tasks.is_empty()
        || batch.has_unqueued_slice(scope)
        || !tasks.iter().all(|t| batch.succeeded().contains_key(t))
    {
        return None;
    }
    Some(
        tasks
            .into_iter()
            .filter_map(|t| batch.take_succeeded(t))
            .collect(),
    )
}

/// How a failed slice scope is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceVerdict {
    /// Not a multi-task slice scope; use the ordinary rules.
    Ordinary,
    /// Buffer-fused slice scope: every node goes back to buffer fusion.
    RollBackToBuffer,
    /// First failure: de-fuse and retry once.
    Retry,
    /// Already retried once; do not loop.
    Exhausted,
}

pub fn classify_failure(
    batch: &mut CompileBatch,
    scope: ScopeId,
    origin: FusionOrigin,
) -> SliceVerdict {
    if !batch.is_slice_scope(scope) {
        return SliceVerdict::Ordinary;
    }
    if origin == FusionOrigin::Buffer {
        return SliceVerdict::RollBackToBuffer;
    }
    if batch.mark_deletion_attempted(scope) {
        SliceVerdict::Retry
    } else {
        SliceVerdict::Exhausted
    }
}
