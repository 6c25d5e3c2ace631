// dispatch.rs — Scope → compile task submission
//
// Turns each scope into one or more compile requests, draws a task id for
// each from the `IdAllocator`, hands them to the kernel compiler and records
// the accepted ones in the current `CompileBatch`.
//
// Preconditions: every node id in the scope group exists in the graph.
// Postconditions: every accepted task is registered as outstanding; every
//                 rejected task is in the batch's failed bucket (batch mode).
// Failure modes: unknown nodes (fatal); a rejected single-op submission
//                aborts with `SchedulerError::SubmitRejected`.
// Side effects: writes `unsupport_dynamic_shape` on ops the compiler cannot
//               build for dynamic shapes; slice submissions rewrite tensor
//               slice shapes (see `slice.rs`).

use tracing::{debug, warn};

use crate::batch::{CompileBatch, CompileTask, TaskKind};
use crate::compiler::{BuildCode, CompileRequest, KernelCompiler};
use crate::diag::{codes, DiagLevel, Diagnostic, OpRef};
use crate::error::SchedulerError;
use crate::graph::{attr, AttrValue, Graph};
use crate::id::{IdAllocator, NodeId, ScopeId, TaskId, WorkerHandle};
use crate::options::{CompileStrategy, SchedulerOptions};
use crate::scope::ScopeGroup;
use crate::slice::SliceTaskCoordinator;

/// Whether a submission belongs to a batch or compiles one op on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Rejections are recorded and dispatch continues.
    Batch,
    /// The first rejection aborts the call.
    SingleOp,
}

pub struct TaskDispatcher<'c> {
    compiler: &'c dyn KernelCompiler,
    ids: &'c dyn IdAllocator,
    fuzzy_build: bool,
}

impl<'c> TaskDispatcher<'c> {
    pub fn new(
        compiler: &'c dyn KernelCompiler,
        ids: &'c dyn IdAllocator,
        options: &SchedulerOptions,
    ) -> Self {
        TaskDispatcher {
            compiler,
            ids,
            fuzzy_build: options.fuzzy_build,
        }
    }

    pub(crate) fn compiler(&self) -> &'c dyn KernelCompiler {
        self.compiler
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        self.ids.next()
    }

    /// Submit every scope of `scopes` in batch mode.
    pub fn dispatch_all(
        &self,
        graph: &mut Graph,
        scopes: &ScopeGroup,
        strategy: CompileStrategy,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<(), SchedulerError> {
        for (scope, nodes) in scopes.iter() {
            self.submit_scope(graph, scope, nodes, strategy, DispatchMode::Batch, batch, diags)?;
        }
        Ok(())
    }

    /// Submit one scope through whichever entry point fits it: the fuzzy
    /// entry point for eligible single ops, per-slice submission for
    /// auto-thread scopes, the ordinary one otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_scope(
        &self,
        graph: &mut Graph,
        scope: ScopeId,
        nodes: &[NodeId],
        strategy: CompileStrategy,
        mode: DispatchMode,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<(), SchedulerError> {
        if self.is_fuzzy_candidate(graph, nodes)? {
            self.submit_fuzzy(graph, scope, nodes, strategy, mode, batch, diags)?;
            return Ok(());
        }
        if SliceTaskCoordinator::applies(graph, nodes)? {
            SliceTaskCoordinator::new(self)
                .submit_sliced(graph, scope, nodes, strategy, mode, batch, diags)?;
            return Ok(());
        }
        self.submit(graph, scope, nodes, strategy, mode, batch, diags)?;
        Ok(())
    }

    fn is_fuzzy_candidate(&self, graph: &Graph, nodes: &[NodeId]) -> Result<bool, SchedulerError> {
        if !self.fuzzy_build || nodes.len() != 1 {
            return Ok(false);
        }
        Ok(graph.node(nodes[0])?.fuzzy_build)
    }

    /// Ordinary submission of the whole scope as one task.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        graph: &mut Graph,
        scope: ScopeId,
        nodes: &[NodeId],
        strategy: CompileStrategy,
        mode: DispatchMode,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Option<TaskId>, SchedulerError> {
        let task_id = self.next_task_id();
        let code = {
            let request = self.request(graph, task_id, scope, batch.worker(), strategy, nodes)?;
            self.compiler.submit(&request)
        };
        let task = CompileTask {
            task_id,
            scope_id: scope,
            kind: TaskKind::Normal,
            strategy,
        };
        self.settle(graph, task, nodes, code, mode, batch, diags)
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_fuzzy(
        &self,
        graph: &mut Graph,
        scope: ScopeId,
        nodes: &[NodeId],
        strategy: CompileStrategy,
        mode: DispatchMode,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Option<TaskId>, SchedulerError> {
        let task_id = self.next_task_id();
        let code = {
            let request = self.request(graph, task_id, scope, batch.worker(), strategy, nodes)?;
            self.compiler.submit_fuzzy(&request)
        };
        let task = CompileTask {
            task_id,
            scope_id: scope,
            kind: TaskKind::Normal,
            strategy,
        };
        self.settle(graph, task, nodes, code, mode, batch, diags)
    }

    pub(crate) fn request<'g>(
        &self,
        graph: &'g Graph,
        task_id: TaskId,
        scope: ScopeId,
        worker: WorkerHandle,
        strategy: CompileStrategy,
        nodes: &[NodeId],
    ) -> Result<CompileRequest<'g>, SchedulerError> {
        let nodes = nodes
            .iter()
            .map(|id| graph.node(*id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompileRequest {
            task_id,
            scope_id: scope,
            worker,
            strategy,
            nodes,
        })
    }

    /// Record the compiler's answer to one submission.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn settle(
        &self,
        graph: &mut Graph,
        task: CompileTask,
        nodes: &[NodeId],
        code: BuildCode,
        mode: DispatchMode,
        batch: &mut CompileBatch,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Option<TaskId>, SchedulerError> {
        match code {
            BuildCode::Accepted => {
                debug!(
                    task_id = task.task_id.0,
                    scope_id = task.scope_id.0,
                    worker = batch.worker().0,
                    kind = ?task.kind,
                    strategy = task.strategy.as_str(),
                    "compile task submitted"
                );
                batch.register(task);
                Ok(Some(task.task_id))
            }
            BuildCode::DynamicShapeUnsupported => {
                for id in nodes {
                    graph.set_attr(*id, attr::UNSUPPORT_DYNAMIC_SHAPE, AttrValue::Bool(true))?;
                    let op = OpRef::of(graph.node(*id)?).in_task(task.task_id, batch.worker());
                    diags.push(
                        Diagnostic::new(
                            DiagLevel::Warning,
                            format!("'{}' does not support dynamic shapes", op.name),
                        )
                        .with_code(codes::W0101)
                        .with_op(op),
                    );
                }
                if let TaskKind::Slice { .. } = task.kind {
                    batch.record_unqueued_slice(task.scope_id);
                }
                debug!(
                    task_id = task.task_id.0,
                    scope_id = task.scope_id.0,
                    "dynamic shape unsupported, task not queued"
                );
                Ok(None)
            }
            BuildCode::Rejected => {
                for id in nodes {
                    let op = OpRef::of(graph.node(*id)?).in_task(task.task_id, batch.worker());
                    diags.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            format!("kernel compiler rejected '{}'", op.name),
                        )
                        .with_code(codes::E0101)
                        .with_op(op),
                    );
                }
                warn!(
                    task_id = task.task_id.0,
                    scope_id = task.scope_id.0,
                    worker = batch.worker().0,
                    "compile submission rejected"
                );
                if mode == DispatchMode::SingleOp {
                    let first = graph.node(nodes[0])?;
                    return Err(SchedulerError::SubmitRejected {
                        name: first.name.clone(),
                        op_type: first.op_type.clone(),
                    });
                }
                batch.record_rejected(task);
                Ok(Some(task.task_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::id::SequentialTaskIds;
    use crate::scripted::{CompilePlan, Entry, ScriptedCompiler};

    fn group_of(graph: &Graph) -> ScopeGroup {
        let mut group = ScopeGroup::new();
        for node in graph.nodes() {
            group.push(node.scope_id.unwrap(), node.id);
        }
        group
    }

    #[test]
    fn each_scope_becomes_one_task() {
        let mut graph = Graph::from_nodes([
            Node::op("conv", "Conv2D").in_scope(1),
            Node::op("relu", "Relu").in_scope(1),
            Node::op("add", "Add").in_scope(-1),
        ]);
        let compiler = ScriptedCompiler::new(CompilePlan::default());
        let ids = SequentialTaskIds::starting_at(100);
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &SchedulerOptions::default());
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let mut diags = Vec::new();
        let group = group_of(&graph);
        dispatcher
            .dispatch_all(
                &mut graph,
                &group,
                CompileStrategy::Default,
                &mut batch,
                &mut diags,
            )
            .unwrap();
        assert_eq!(batch.outstanding(), 2);
        // BTreeMap order: scope -1 before scope 1.
        assert_eq!(batch.scope_of(TaskId(100)).unwrap(), ScopeId(-1));
        assert_eq!(batch.scope_of(TaskId(101)).unwrap(), ScopeId(1));
        let subs = compiler.submissions();
        assert_eq!(subs[1].node_names, vec!["conv", "relu"]);
        assert!(diags.is_empty());
    }

    #[test]
    fn fuzzy_single_op_uses_fuzzy_entry() {
        let mut graph = Graph::from_nodes([Node::op("add", "Add").in_scope(-1).with_fuzzy_build()]);
        let compiler = ScriptedCompiler::new(CompilePlan::default());
        let ids = SequentialTaskIds::default();
        let options = SchedulerOptions {
            fuzzy_build: true,
            ..SchedulerOptions::default()
        };
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &options);
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let group = group_of(&graph);
        dispatcher
            .dispatch_all(
                &mut graph,
                &group,
                CompileStrategy::FuzzyOnline,
                &mut batch,
                &mut Vec::new(),
            )
            .unwrap();
        assert_eq!(compiler.submissions()[0].entry, Entry::Fuzzy);
    }

    #[test]
    fn fuzzy_flag_without_runtime_support_builds_normally() {
        let mut graph = Graph::from_nodes([Node::op("add", "Add").in_scope(-1).with_fuzzy_build()]);
        let compiler = ScriptedCompiler::new(CompilePlan::default());
        let ids = SequentialTaskIds::default();
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &SchedulerOptions::default());
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let group = group_of(&graph);
        dispatcher
            .dispatch_all(
                &mut graph,
                &group,
                CompileStrategy::Default,
                &mut batch,
                &mut Vec::new(),
            )
            .unwrap();
        assert_eq!(compiler.submissions()[0].entry, Entry::Normal);
    }

    #[test]
    fn rejection_in_batch_is_recorded_and_dispatch_continues() {
        let mut graph = Graph::from_nodes([
            Node::op("bad", "Bad").in_scope(-1),
            Node::op("good", "Add").in_scope(-2),
        ]);
        let plan = CompilePlan {
            rejections: vec!["bad".into()],
            ..CompilePlan::default()
        };
        let compiler = ScriptedCompiler::new(plan);
        let ids = SequentialTaskIds::default();
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &SchedulerOptions::default());
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let mut diags = Vec::new();
        let group = group_of(&graph);
        dispatcher
            .dispatch_all(
                &mut graph,
                &group,
                CompileStrategy::Default,
                &mut batch,
                &mut diags,
            )
            .unwrap();
        assert_eq!(batch.total_issued(), 2);
        assert_eq!(batch.outstanding(), 1);
        assert_eq!(batch.failed_scopes().unwrap(), vec![ScopeId(-1)]);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0101));
        assert_eq!(diags[0].op.as_ref().unwrap().name, "bad");
    }

    #[test]
    fn rejection_in_single_op_mode_aborts() {
        let mut graph = Graph::from_nodes([Node::op("bad", "Bad").in_scope(-1)]);
        let plan = CompilePlan {
            rejections: vec!["bad".into()],
            ..CompilePlan::default()
        };
        let compiler = ScriptedCompiler::new(plan);
        let ids = SequentialTaskIds::default();
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &SchedulerOptions::default());
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let err = dispatcher
            .submit_scope(
                &mut graph,
                ScopeId(-1),
                &[NodeId(0)],
                CompileStrategy::Default,
                DispatchMode::SingleOp,
                &mut batch,
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SubmitRejected { ref name, .. } if name == "bad"));
    }

    #[test]
    fn dynamic_shape_unsupported_flags_node_instead_of_failing() {
        let mut graph = Graph::from_nodes([Node::op("where", "Where").in_scope(-1)]);
        let plan = CompilePlan {
            dynamic_shape_unsupported: vec!["Where".into()],
            ..CompilePlan::default()
        };
        let compiler = ScriptedCompiler::new(plan);
        let ids = SequentialTaskIds::default();
        let dispatcher = TaskDispatcher::new(&compiler, &ids, &SchedulerOptions::default());
        let mut batch = CompileBatch::new(WorkerHandle(1));
        let mut diags = Vec::new();
        let group = group_of(&graph);
        dispatcher
            .dispatch_all(
                &mut graph,
                &group,
                CompileStrategy::Default,
                &mut batch,
                &mut diags,
            )
            .unwrap();
        assert_eq!(batch.total_issued(), 0);
        assert!(batch.failed().is_empty());
        assert!(graph
            .node(NodeId(0))
            .unwrap()
            .bool_attr(attr::UNSUPPORT_DYNAMIC_SHAPE));
        assert_eq!(diags[0].code, Some(codes::W0101));
    }
}
