// route.rs — Success propagation and failure classification
//
// Successes write compiler metadata onto every node of the owning scope;
// slice scopes only count once their whole task set succeeded. Failures are
// classified per scope, in a fixed order:
//   1. L1-fusion scope      → handed back to the L1 fusion pass
//   2. buffer-fusion scope  → handed back to the buffer fusion pass
//   3. anything else        → kept for de-fusion and one retry
//
// Preconditions: the batch has no outstanding tasks.
// Postconditions: rolled-back scopes are gone from the batch's failure set;
//                 every scope is classified at most once per `RetryContext`.
// Failure modes: task or scope ids missing from the bookkeeping (fatal).
// Side effects: writes metadata attributes on compiled nodes; clears the
//               L1 fusion tag of rolled-back L1 nodes.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::batch::{CompileBatch, CompileMetadata};
use crate::diag::{codes, DiagLevel, Diagnostic, OpRef};
use crate::error::SchedulerError;
use crate::graph::{attr, AttrValue, FusionOrigin, Graph};
use crate::id::{NodeId, ScopeId, TaskId};
use crate::retry::{NodeState, RetryContext, RollbackLayer, ScopeVerdict};
use crate::scope::ScopeGroup;
use crate::slice::{self, SliceVerdict};

/// Failed scopes sorted by what happens next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub l1_rollback: Vec<NodeId>,
    pub ub_rollback: Vec<NodeId>,
    pub retry: Vec<ScopeId>,
    pub exhausted: Vec<ScopeId>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.l1_rollback.is_empty()
            && self.ub_rollback.is_empty()
            && self.retry.is_empty()
            && self.exhausted.is_empty()
    }
}

pub struct OutcomeRouter;

impl OutcomeRouter {
    /// Propagate every complete success of the batch onto the graph and
    /// consume it from the success bucket. Returns the compiled scopes.
    pub fn route_success(
        graph: &mut Graph,
        scopes: &ScopeGroup,
        batch: &mut CompileBatch,
        ctx: &mut RetryContext,
    ) -> Result<Vec<ScopeId>, SchedulerError> {
        slice::purge_partial_successes(batch)?;

        let tasks: Vec<TaskId> = batch.succeeded().keys().copied().collect();
        let mut compiled = Vec::new();
        for task in tasks {
            if !batch.succeeded().contains_key(&task) {
                // Consumed with an earlier member of its slice set.
                continue;
            }
            let scope = batch.scope_of(task)?;
            let nodes = scopes.nodes(scope)?.to_vec();

            if batch.slice_tasks(scope).is_empty() {
                let Some(outcome) = batch.take_succeeded(task) else {
                    continue;
                };
                write_metadata(graph, &nodes, &outcome.metadata)?;
                mark_succeeded(ctx, &nodes, &outcome.metadata);
            } else if batch.has_unqueued_slice(scope) {
                // A partial slice set publishes nothing.
                for t in batch.slice_tasks(scope).to_vec() {
                    batch.take_succeeded(t);
                }
                debug!(scope_id = scope.0, "slice set incomplete, nothing published");
                continue;
            } else {
                let Some(set) = slice::take_complete_set(batch, scope) else {
                    continue;
                };
                let Some(first) = set.first() else {
                    continue;
                };
                write_metadata(graph, &nodes, &first.metadata)?;
                let paths: Vec<String> = set
                    .iter()
                    .filter_map(|o| o.metadata.kernel_path.clone())
                    .collect();
                for node in &nodes {
                    let value = AttrValue::List(paths.clone());
                    graph.set_attr(*node, attr::SLICE_KERNEL_PATHS, value)?;
                }
                mark_succeeded(ctx, &nodes, &first.metadata);
            }
            debug!(scope_id = scope.0, nodes = nodes.len(), "scope compiled");
            compiled.push(scope);
        }
        Ok(compiled)
    }

    /// Classify every failed scope of the batch.
    ///
    /// Routing the same failures twice is harmless: scopes that already have
    /// a verdict in `ctx` are skipped, so no scope lands in two lists.
    pub fn route_failures(
        graph: &mut Graph,
        scopes: &ScopeGroup,
        batch: &mut CompileBatch,
        ctx: &mut RetryContext,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Classification, SchedulerError> {
        let mut out = Classification::default();
        let mut l1_seen = BTreeSet::new();
        let mut ub_seen = BTreeSet::new();

        for scope in batch.failed_scopes()? {
            if let Some(previous) = ctx.verdict(scope) {
                if let ScopeVerdict::RolledBack(_) = previous {
                    batch.clear_failures_of(scope);
                }
                continue;
            }
            let nodes = scopes.nodes(scope)?.to_vec();
            let origin = scope_origin(graph, &nodes)?;

            let verdict = if origin == FusionOrigin::L1 {
                ScopeVerdict::RolledBack(RollbackLayer::L1Fusion)
            } else {
                match slice::classify_failure(batch, scope, origin) {
                    SliceVerdict::RollBackToBuffer => {
                        ScopeVerdict::RolledBack(RollbackLayer::BufferFusion)
                    }
                    SliceVerdict::Retry => ScopeVerdict::Retry,
                    SliceVerdict::Exhausted => ScopeVerdict::Exhausted,
                    SliceVerdict::Ordinary if origin == FusionOrigin::Buffer => {
                        ScopeVerdict::RolledBack(RollbackLayer::BufferFusion)
                    }
                    SliceVerdict::Ordinary => ScopeVerdict::Retry,
                }
            };

            match verdict {
                ScopeVerdict::RolledBack(layer) => {
                    batch.clear_failures_of(scope);
                    let (list, seen) = match layer {
                        RollbackLayer::L1Fusion => (&mut out.l1_rollback, &mut l1_seen),
                        RollbackLayer::BufferFusion => (&mut out.ub_rollback, &mut ub_seen),
                    };
                    for node in &nodes {
                        if layer == RollbackLayer::L1Fusion {
                            graph.node_mut(*node)?.fusion_origin = FusionOrigin::None;
                        }
                        if seen.insert(*node) {
                            list.push(*node);
                        }
                        ctx.set_state(*node, NodeState::RolledBackTo(layer));
                    }
                    warn!(scope_id = scope.0, layer = %layer, "failed scope handed back");
                    diags.push(rollback_diag(graph, scope, &nodes, layer)?);
                }
                ScopeVerdict::Retry => out.retry.push(scope),
                ScopeVerdict::Exhausted => out.exhausted.push(scope),
            }
            ctx.record_verdict(scope, verdict);
        }
        Ok(out)
    }
}

/// The fusion pass that produced a scope. L1 wins over buffer fusion.
pub fn scope_origin(graph: &Graph, nodes: &[NodeId]) -> Result<FusionOrigin, SchedulerError> {
    let mut origin = FusionOrigin::None;
    for id in nodes {
        match graph.node(*id)?.fusion_origin {
            FusionOrigin::L1 => return Ok(FusionOrigin::L1),
            FusionOrigin::Buffer => origin = FusionOrigin::Buffer,
            FusionOrigin::None => {}
        }
    }
    Ok(origin)
}

fn write_metadata(
    graph: &mut Graph,
    nodes: &[NodeId],
    meta: &CompileMetadata,
) -> Result<(), SchedulerError> {
    for node in nodes {
        if let Some(path) = &meta.kernel_path {
            graph.set_attr(*node, attr::KERNEL_PATH, AttrValue::Str(path.clone()))?;
        }
        if let Some(json) = &meta.compile_info_json {
            graph.set_attr(*node, attr::COMPILE_INFO_JSON, AttrValue::Str(json.clone()))?;
        }
        if let Some(key) = &meta.compile_info_key {
            graph.set_attr(*node, attr::COMPILE_INFO_KEY, AttrValue::Str(key.clone()))?;
        }
        for (k, v) in &meta.extra {
            graph.set_attr(*node, k, AttrValue::Str(v.clone()))?;
        }
    }
    Ok(())
}

fn mark_succeeded(ctx: &mut RetryContext, nodes: &[NodeId], meta: &CompileMetadata) {
    for node in nodes {
        ctx.set_state(*node, NodeState::Succeeded(meta.clone()));
    }
}

fn rollback_diag(
    graph: &Graph,
    scope: ScopeId,
    nodes: &[NodeId],
    layer: RollbackLayer,
) -> Result<Diagnostic, SchedulerError> {
    let code = match layer {
        RollbackLayer::L1Fusion => codes::W0102,
        RollbackLayer::BufferFusion => codes::W0103,
    };
    let mut diag = Diagnostic::new(
        DiagLevel::Warning,
        format!("scope {} failed to compile; handed back to {}", scope, layer),
    )
    .with_code(code);
    for id in nodes {
        let node = graph.node(*id)?;
        diag = diag.with_cause(format!("{} ({})", node.name, node.op_type));
    }
    if let Some(first) = nodes.first() {
        diag = diag.with_op(OpRef::of(graph.node(*first)?));
    }
    Ok(diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{CompileTask, TaskKind, TaskOutcome};
    use crate::graph::Node;
    use crate::id::WorkerHandle;
    use crate::options::CompileStrategy;

    fn register(batch: &mut CompileBatch, task: u64, scope: i64, kind: TaskKind) {
        batch.register(CompileTask {
            task_id: TaskId(task),
            scope_id: ScopeId(scope),
            kind,
            strategy: CompileStrategy::Default,
        });
    }

    fn meta(path: &str) -> CompileMetadata {
        CompileMetadata {
            kernel_path: Some(path.into()),
            compile_info_json: Some("{}".into()),
            compile_info_key: Some(format!("key_{path}")),
            ..CompileMetadata::default()
        }
    }

    fn setup() -> (Graph, ScopeGroup) {
        let graph = Graph::from_nodes([
            Node::op("l1a", "Conv2D").in_scope(1).with_origin(FusionOrigin::L1),
            Node::op("l1b", "Relu").in_scope(1).with_origin(FusionOrigin::L1),
            Node::op("uba", "MatMul").in_scope(2).with_origin(FusionOrigin::Buffer),
            Node::op("plain", "Add").in_scope(3),
            Node::op("sl", "MatMul").in_scope(4),
        ]);
        let scopes: ScopeGroup = [
            (ScopeId(1), vec![NodeId(0), NodeId(1)]),
            (ScopeId(2), vec![NodeId(2)]),
            (ScopeId(3), vec![NodeId(3)]),
            (ScopeId(4), vec![NodeId(4)]),
        ]
        .into_iter()
        .collect();
        (graph, scopes)
    }

    #[test]
    fn success_writes_metadata_on_every_scope_node() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 1, TaskKind::Normal);
        batch.bucket(TaskOutcome::succeeded(TaskId(1), meta("k1.o"))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let compiled =
            OutcomeRouter::route_success(&mut graph, &scopes, &mut batch, &mut ctx).unwrap();
        assert_eq!(compiled, vec![ScopeId(1)]);
        for id in [NodeId(0), NodeId(1)] {
            let node = graph.node(id).unwrap();
            assert_eq!(node.str_attr(attr::KERNEL_PATH), Some("k1.o"));
            assert_eq!(node.str_attr(attr::COMPILE_INFO_KEY), Some("key_k1.o"));
            assert!(matches!(ctx.state(id), Some(NodeState::Succeeded(_))));
        }
        assert!(batch.succeeded().is_empty());
    }

    #[test]
    fn slice_success_waits_for_the_whole_set() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 4, TaskKind::Slice { index: 0 });
        register(&mut batch, 2, 4, TaskKind::Slice { index: 1 });
        batch.bucket(TaskOutcome::succeeded(TaskId(2), meta("s1.o"))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let compiled =
            OutcomeRouter::route_success(&mut graph, &scopes, &mut batch, &mut ctx).unwrap();
        assert!(compiled.is_empty());
        assert_eq!(batch.succeeded().len(), 1);

        batch.bucket(TaskOutcome::succeeded(TaskId(1), meta("s0.o"))).unwrap();
        let compiled =
            OutcomeRouter::route_success(&mut graph, &scopes, &mut batch, &mut ctx).unwrap();
        assert_eq!(compiled, vec![ScopeId(4)]);
        let node = graph.node(NodeId(4)).unwrap();
        assert_eq!(node.str_attr(attr::KERNEL_PATH), Some("s0.o"));
        assert_eq!(
            node.list_attr(attr::SLICE_KERNEL_PATHS),
            &["s0.o".to_string(), "s1.o".to_string()]
        );
    }

    #[test]
    fn partial_slice_success_propagates_nothing() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 4, TaskKind::Slice { index: 0 });
        register(&mut batch, 2, 4, TaskKind::Slice { index: 1 });
        batch.bucket(TaskOutcome::succeeded(TaskId(1), meta("s0.o"))).unwrap();
        batch.bucket(TaskOutcome::failed(TaskId(2))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let compiled =
            OutcomeRouter::route_success(&mut graph, &scopes, &mut batch, &mut ctx).unwrap();
        assert!(compiled.is_empty());
        assert!(graph.node(NodeId(4)).unwrap().str_attr(attr::KERNEL_PATH).is_none());
        assert_eq!(batch.failed().len(), 2);

        let class = OutcomeRouter::route_failures(
            &mut graph,
            &scopes,
            &mut batch,
            &mut ctx,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(class.retry, vec![ScopeId(4)]);
    }

    #[test]
    fn slice_set_with_unqueued_slice_publishes_nothing() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 4, TaskKind::Slice { index: 0 });
        // Slice 1 came back as dynamic-shape-unsupported and was never queued.
        batch.record_unqueued_slice(ScopeId(4));
        batch.bucket(TaskOutcome::succeeded(TaskId(1), meta("s0.o"))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let compiled =
            OutcomeRouter::route_success(&mut graph, &scopes, &mut batch, &mut ctx).unwrap();
        assert!(compiled.is_empty());
        let node = graph.node(NodeId(4)).unwrap();
        assert!(node.str_attr(attr::KERNEL_PATH).is_none());
        assert!(node.list_attr(attr::SLICE_KERNEL_PATHS).is_empty());
        assert!(batch.succeeded().is_empty());
        assert_eq!(ctx.state(NodeId(4)), None);
    }

    #[test]
    fn failures_are_classified_in_fixed_order() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        for (task, scope) in [(1, 1), (2, 2), (3, 3)] {
            register(&mut batch, task, scope, TaskKind::Normal);
            batch.bucket(TaskOutcome::failed(TaskId(task))).unwrap();
        }
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let mut diags = Vec::new();
        let class =
            OutcomeRouter::route_failures(&mut graph, &scopes, &mut batch, &mut ctx, &mut diags)
                .unwrap();

        assert_eq!(class.l1_rollback, vec![NodeId(0), NodeId(1)]);
        assert_eq!(class.ub_rollback, vec![NodeId(2)]);
        assert_eq!(class.retry, vec![ScopeId(3)]);
        assert_eq!(batch.failed_scopes().unwrap(), vec![ScopeId(3)]);
        assert_eq!(graph.node(NodeId(0)).unwrap().fusion_origin, FusionOrigin::None);
        assert_eq!(
            ctx.state(NodeId(2)),
            Some(&NodeState::RolledBackTo(RollbackLayer::BufferFusion))
        );
        let got: Vec<_> = diags.iter().filter_map(|d| d.code).collect();
        assert_eq!(got, vec![codes::W0102, codes::W0103]);
    }

    #[test]
    fn routing_failures_twice_does_not_double_count() {
        let (mut graph, scopes) = setup();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        for (task, scope) in [(1, 1), (2, 3)] {
            register(&mut batch, task, scope, TaskKind::Normal);
            batch.bucket(TaskOutcome::failed(TaskId(task))).unwrap();
        }
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let first = OutcomeRouter::route_failures(
            &mut graph,
            &scopes,
            &mut batch,
            &mut ctx,
            &mut Vec::new(),
        )
        .unwrap();
        let second = OutcomeRouter::route_failures(
            &mut graph,
            &scopes,
            &mut batch,
            &mut ctx,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(first.l1_rollback.len(), 2);
        assert!(second.is_empty());
        // The L1 tag was stripped by the first pass; the scope must still not
        // be reclassified as plain.
        assert!(!second.retry.contains(&ScopeId(1)));
    }

    #[test]
    fn buffer_fused_slice_scope_rolls_back_each_node_once() {
        let mut graph = Graph::from_nodes([
            Node::op("a", "MatMul").in_scope(8).with_origin(FusionOrigin::Buffer),
            Node::op("b", "Add").in_scope(8).with_origin(FusionOrigin::Buffer),
        ]);
        let scopes: ScopeGroup = [(ScopeId(8), vec![NodeId(0), NodeId(1)])]
            .into_iter()
            .collect();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 8, TaskKind::Slice { index: 0 });
        register(&mut batch, 2, 8, TaskKind::Slice { index: 3 });
        batch.bucket(TaskOutcome::failed(TaskId(1))).unwrap();
        batch.bucket(TaskOutcome::failed(TaskId(2))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let class = OutcomeRouter::route_failures(
            &mut graph,
            &scopes,
            &mut batch,
            &mut ctx,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(class.ub_rollback, vec![NodeId(0), NodeId(1)]);
        assert!(class.retry.is_empty());
        assert!(batch.failed().is_empty());
    }

    #[test]
    fn unknown_scope_during_routing_is_fatal() {
        let (mut graph, _) = setup();
        let scopes = ScopeGroup::new();
        let mut batch = CompileBatch::new(WorkerHandle(1));
        register(&mut batch, 1, 3, TaskKind::Normal);
        batch.bucket(TaskOutcome::failed(TaskId(1))).unwrap();
        let mut ctx = RetryContext::new(CompileStrategy::Default);
        let err = OutcomeRouter::route_failures(
            &mut graph,
            &scopes,
            &mut batch,
            &mut ctx,
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownScope { scope: ScopeId(3) }));
    }
}
