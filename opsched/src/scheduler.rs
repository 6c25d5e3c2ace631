// scheduler.rs — Operator compile scheduling
//
// Drives one compilation call end to end:
//
//   Batched → AwaitingCompletion → {AllSucceeded, PartiallyFailed}
//           → Demoted → Resubmitted → AwaitingCompletion → Terminal
//
// Round 1 compiles every scope. Failed scopes are classified: L1 and buffer
// fusion scopes go back to their fusion pass, plain scopes are de-fused into
// singletons and resubmitted once with the ordinary strategy. Whatever still
// fails after that round is reported; there is no third round.
//
// Preconditions: the compiler delivers completions for `worker` only to
//                callers polling with `worker`.
// Postconditions: every op of the scope group is compiled, failed, handed
//                 back for rollback, or flagged as dynamic-shape unsupported.
// Failure modes: bookkeeping inconsistencies, scope id exhaustion, missing
//                node identity, an exceeded opt-in deadline, or a rejected
//                single-op submission (all fatal, returned as `Err`).
// Side effects: writes scope ids, fusion markers and compile metadata onto
//               graph nodes; blocks the calling thread while waiting.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::batch::CompileBatch;
use crate::compiler::KernelCompiler;
use crate::diag::{codes, DiagLevel, Diagnostic, OpRef};
use crate::dispatch::{DispatchMode, TaskDispatcher};
use crate::error::SchedulerError;
use crate::graph::Graph;
use crate::id::{IdAllocator, NodeId, ScopeId, ScopeIdAllocator, WorkerHandle};
use crate::options::{CompileStrategy, SchedulerOptions};
use crate::poll::CompletionPoller;
use crate::report::{CompileReport, FailedOp, Terminal};
use crate::retry::{NodeState, RetryContext, RetryCoordinator, SuppressReason};
use crate::route::{Classification, OutcomeRouter};
use crate::scope::{check_identity, group_scopes, verify_scope_group, ScopeGroup};

/// Retry state machine positions, recorded in order on the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Batched,
    AwaitingCompletion,
    AllSucceeded,
    PartiallyFailed,
    Demoted,
    Resubmitted,
    Terminal(Terminal),
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Batched => write!(f, "batched"),
            SchedulerState::AwaitingCompletion => write!(f, "awaiting_completion"),
            SchedulerState::AllSucceeded => write!(f, "all_succeeded"),
            SchedulerState::PartiallyFailed => write!(f, "partially_failed"),
            SchedulerState::Demoted => write!(f, "demoted"),
            SchedulerState::Resubmitted => write!(f, "resubmitted"),
            SchedulerState::Terminal(t) => write!(f, "terminal({})", t),
        }
    }
}

pub struct OpCompileScheduler<'c> {
    compiler: &'c dyn KernelCompiler,
    ids: &'c dyn IdAllocator,
    options: SchedulerOptions,
}

/// Mutable state of one call, shared by its rounds.
struct Call<'g> {
    graph: &'g mut Graph,
    ctx: RetryContext,
    report: CompileReport,
}

impl<'g> Call<'g> {
    fn enter(&mut self, state: SchedulerState) {
        debug!(state = %state, round = self.ctx.round(), "scheduler transition");
        self.report.transitions.push(state);
    }
}

impl<'c> OpCompileScheduler<'c> {
    pub fn new(
        compiler: &'c dyn KernelCompiler,
        ids: &'c dyn IdAllocator,
        options: SchedulerOptions,
    ) -> Self {
        OpCompileScheduler {
            compiler,
            ids,
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Group the graph's compilable nodes into scopes and compile them.
    pub fn compile_graph(
        &self,
        graph: &mut Graph,
        worker: WorkerHandle,
        strategy: CompileStrategy,
    ) -> Result<CompileReport, SchedulerError> {
        let mut alloc = ScopeIdAllocator::new();
        let mut scopes = group_scopes(graph, self.options.scope_policy, &mut alloc)?;
        debug!(
            scopes = scopes.len(),
            nodes = scopes.node_count(),
            "scope group built"
        );
        self.compile_scopes(graph, &mut scopes, worker, strategy)
    }

    /// Compile an already grouped set of scopes. `scopes` reflects every
    /// demotion on return.
    pub fn compile_scopes(
        &self,
        graph: &mut Graph,
        scopes: &mut ScopeGroup,
        worker: WorkerHandle,
        strategy: CompileStrategy,
    ) -> Result<CompileReport, SchedulerError> {
        verify_scope_group(scopes).into_result()?;

        let mut alloc = ScopeIdAllocator::below(graph.nodes().filter_map(|n| n.scope_id.as_ref()));
        for scope in scopes.scope_ids() {
            alloc.reserve_below(scope);
        }
        let mut retry = RetryCoordinator::new(&self.options, alloc);
        let dispatcher = TaskDispatcher::new(self.compiler, self.ids, &self.options);
        let poller = CompletionPoller::new(self.compiler, &self.options);

        let mut call = Call {
            graph,
            ctx: RetryContext::new(strategy),
            report: CompileReport::new(worker, strategy),
        };
        call.ctx.seed(scopes);

        // ── Round 1 ──
        let round = call.ctx.begin_round();
        let span = info_span!("compile_round", round, worker = worker.0);
        let guard = span.enter();
        let started = Instant::now();

        let mut batch = CompileBatch::new(worker);
        call.enter(SchedulerState::Batched);
        dispatcher.dispatch_all(
            call.graph,
            scopes,
            strategy,
            &mut batch,
            &mut call.report.diagnostics,
        )?;
        call.report.rounds = round;
        call.report.tasks_issued += batch.total_issued();

        if self.options.tuning_without_recovery() {
            // Nothing useful comes from waiting at this tuning step; take
            // what is already done and leave the rest with the compiler.
            poller.drain(&mut batch)?;
            record_build_failures(call.graph, scopes, &batch, &mut call.report.diagnostics)?;
            OutcomeRouter::route_success(call.graph, scopes, &mut batch, &mut call.ctx)?;
            call.report.unfinished = batch.outstanding();
            call.report.suppressed = Some(SuppressReason::TuningStep);
            let failed = batch.failed_scopes()?;
            if !failed.is_empty() {
                suppress(&mut call, scopes, &failed, SuppressReason::TuningStep)?;
            }
            log_round(round, &batch, started);
            drop(guard);
            return finish(call);
        }

        call.enter(SchedulerState::AwaitingCompletion);
        poller.wait_all(&mut batch)?;
        record_build_failures(call.graph, scopes, &batch, &mut call.report.diagnostics)?;
        OutcomeRouter::route_success(call.graph, scopes, &mut batch, &mut call.ctx)?;
        log_round(round, &batch, started);

        if batch.failed().is_empty() {
            call.enter(SchedulerState::AllSucceeded);
            drop(guard);
            return finish(call);
        }
        call.enter(SchedulerState::PartiallyFailed);

        if let Some(reason) = retry.gate(strategy) {
            call.report.suppressed = Some(reason);
            let failed = batch.failed_scopes()?;
            suppress(&mut call, scopes, &failed, reason)?;
            drop(guard);
            return finish(call);
        }

        let class = OutcomeRouter::route_failures(
            call.graph,
            scopes,
            &mut batch,
            &mut call.ctx,
            &mut call.report.diagnostics,
        )?;
        call.ctx.absorb(&batch);
        record_rollbacks(&mut call, &class)?;
        for scope in &class.exhausted {
            give_up(&mut call, scopes, *scope, true)?;
        }
        drop(guard);

        if class.retry.is_empty() {
            return finish(call);
        }

        let demotions = retry.demote(
            call.graph,
            scopes,
            &class.retry,
            &mut call.ctx,
            &mut call.report.diagnostics,
        )?;
        call.enter(SchedulerState::Demoted);

        // ── Round 2 ──
        let round = call.ctx.begin_round();
        let span = info_span!("compile_round", round, worker = worker.0);
        let _guard = span.enter();
        let started = Instant::now();

        let retry_strategy = call.ctx.retry_strategy();
        let mut batch = CompileBatch::continuing(worker, call.ctx.attempted());
        for demotion in &demotions {
            for scope in &demotion.to {
                let nodes = scopes.nodes(*scope)?.to_vec();
                dispatcher.submit_scope(
                    call.graph,
                    *scope,
                    &nodes,
                    retry_strategy,
                    DispatchMode::Batch,
                    &mut batch,
                    &mut call.report.diagnostics,
                )?;
            }
        }
        call.report.demotions = demotions;
        call.report.rounds = round;
        call.report.tasks_issued += batch.total_issued();
        call.enter(SchedulerState::Resubmitted);

        call.enter(SchedulerState::AwaitingCompletion);
        poller.wait_all(&mut batch)?;
        record_build_failures(call.graph, scopes, &batch, &mut call.report.diagnostics)?;
        OutcomeRouter::route_success(call.graph, scopes, &mut batch, &mut call.ctx)?;
        log_round(round, &batch, started);

        let class = OutcomeRouter::route_failures(
            call.graph,
            scopes,
            &mut batch,
            &mut call.ctx,
            &mut call.report.diagnostics,
        )?;
        call.ctx.absorb(&batch);
        record_rollbacks(&mut call, &class)?;
        // There is no third round: a scope asking for another retry fails here.
        let mut last: Vec<ScopeId> = class.exhausted.iter().chain(&class.retry).copied().collect();
        last.sort();
        for scope in last {
            give_up(&mut call, scopes, scope, true)?;
        }
        finish(call)
    }

    /// Compile one node on its own, outside any batch. A rejected submission
    /// aborts the call; a failed build is reported without retry.
    pub fn compile_single_op(
        &self,
        graph: &mut Graph,
        node: NodeId,
        worker: WorkerHandle,
        strategy: CompileStrategy,
    ) -> Result<CompileReport, SchedulerError> {
        let target = graph.node(node)?;
        check_identity(target)?;
        if !target.kind.is_compilable() {
            debug!(
                node = node.0,
                kind = ?target.kind,
                "node needs no kernel, nothing submitted"
            );
            return Ok(CompileReport::new(worker, strategy).finish());
        }
        let current = target.scope_id;
        let scope = match current {
            Some(scope) if scope.0 != 0 => scope,
            _ => {
                let mut alloc =
                    ScopeIdAllocator::below(graph.nodes().filter_map(|n| n.scope_id.as_ref()));
                let fresh = alloc.alloc()?;
                graph.set_scope(node, fresh)?;
                fresh
            }
        };
        let scopes: ScopeGroup = [(scope, vec![node])].into_iter().collect();
        let dispatcher = TaskDispatcher::new(self.compiler, self.ids, &self.options);
        let poller = CompletionPoller::new(self.compiler, &self.options);

        let mut call = Call {
            graph,
            ctx: RetryContext::new(strategy),
            report: CompileReport::new(worker, strategy),
        };
        call.ctx.seed(&scopes);

        let round = call.ctx.begin_round();
        let span = info_span!("compile_round", round, worker = worker.0, single_op = true);
        let _guard = span.enter();
        let started = Instant::now();

        let mut batch = CompileBatch::new(worker);
        call.enter(SchedulerState::Batched);
        dispatcher.submit_scope(
            call.graph,
            scope,
            &[node],
            strategy,
            DispatchMode::SingleOp,
            &mut batch,
            &mut call.report.diagnostics,
        )?;
        call.report.rounds = round;
        call.report.tasks_issued = batch.total_issued();

        call.enter(SchedulerState::AwaitingCompletion);
        poller.wait_all(&mut batch)?;
        record_build_failures(call.graph, &scopes, &batch, &mut call.report.diagnostics)?;
        OutcomeRouter::route_success(call.graph, &scopes, &mut batch, &mut call.ctx)?;
        log_round(round, &batch, started);

        if batch.failed().is_empty() {
            call.enter(SchedulerState::AllSucceeded);
        } else {
            call.enter(SchedulerState::PartiallyFailed);
            give_up(&mut call, &scopes, scope, false)?;
        }
        finish(call)
    }
}

/// E0100 for every task the compiler reported as failed. Rejected tasks
/// already carry E0101 from dispatch.
fn record_build_failures(
    graph: &Graph,
    scopes: &ScopeGroup,
    batch: &CompileBatch,
    diags: &mut Vec<Diagnostic>,
) -> Result<(), SchedulerError> {
    for task in batch.failed().keys() {
        if batch.was_rejected(*task) {
            continue;
        }
        let scope = batch.scope_of(*task)?;
        let kind = batch.task(*task)?.kind;
        for id in scopes.nodes(scope)? {
            let node = graph.node(*id)?;
            diags.push(
                Diagnostic::new(
                    DiagLevel::Error,
                    format!("kernel build failed for '{}'", node.name),
                )
                .with_code(codes::E0100)
                .with_op(OpRef::of(node).in_task(*task, batch.worker()))
                .with_cause(format!("{:?} task in scope {}", kind, scope)),
            );
        }
    }
    Ok(())
}

fn record_rollbacks(call: &mut Call<'_>, class: &Classification) -> Result<(), SchedulerError> {
    for node in &class.l1_rollback {
        call.report.l1_rollback.push(OpRef::of(call.graph.node(*node)?));
    }
    for node in &class.ub_rollback {
        call.report.ub_rollback.push(OpRef::of(call.graph.node(*node)?));
    }
    Ok(())
}

/// Report every node of the failed scopes as failed, without retry.
fn suppress(
    call: &mut Call<'_>,
    scopes: &ScopeGroup,
    failed: &[ScopeId],
    reason: SuppressReason,
) -> Result<(), SchedulerError> {
    warn!(scopes = failed.len(), reason = %reason, "retry suppressed");
    for scope in failed {
        let mut first = None;
        for node in scopes.nodes(*scope)? {
            let op = OpRef::of(call.graph.node(*node)?);
            first.get_or_insert_with(|| op.clone());
            call.ctx.set_state(*node, NodeState::Failed);
            call.report.failed.push(FailedOp {
                op,
                scope: *scope,
                retried: false,
            });
        }
        let mut diag = Diagnostic::new(
            DiagLevel::Error,
            format!("scope {} failed and will not be retried", scope),
        )
        .with_code(codes::E0103)
        .with_hint(reason.to_string());
        if let Some(op) = first {
            diag = diag.with_op(op);
        }
        call.report.diagnostics.push(diag);
    }
    Ok(())
}

/// Final failure of one scope.
fn give_up(
    call: &mut Call<'_>,
    scopes: &ScopeGroup,
    scope: ScopeId,
    retried: bool,
) -> Result<(), SchedulerError> {
    for node in scopes.nodes(scope)? {
        let op = OpRef::of(call.graph.node(*node)?);
        call.ctx.set_state(*node, NodeState::Failed);
        if retried {
            let mut diag = Diagnostic::new(
                DiagLevel::Error,
                format!("'{}' failed to compile after retry", op.name),
            )
            .with_code(codes::E0102)
            .with_op(op.clone());
            if let Some(previous) = call.ctx.previous_scope(*node) {
                if previous != scope {
                    diag = diag.with_cause(format!("originally fused in scope {}", previous));
                }
            }
            call.report.diagnostics.push(diag);
        }
        call.report.failed.push(FailedOp { op, scope, retried });
    }
    warn!(scope_id = scope.0, retried, "scope failed to compile");
    Ok(())
}

fn finish(call: Call<'_>) -> Result<CompileReport, SchedulerError> {
    let Call {
        graph,
        ctx,
        mut report,
    } = call;
    for (node, state) in ctx.states() {
        if let NodeState::Succeeded(_) = state {
            report.compiled.push(OpRef::of(graph.node(*node)?));
        }
    }
    let report = report.finish();
    info!(
        worker = report.worker.0,
        outcome = %report.outcome,
        rounds = report.rounds,
        tasks = report.tasks_issued,
        compiled = report.compiled.len(),
        failed = report.failed.len(),
        "compile call finished"
    );
    Ok(report)
}

fn log_round(round: u32, batch: &CompileBatch, started: Instant) {
    info!(
        round,
        issued = batch.total_issued(),
        succeeded = batch.succeeded().len(),
        failed = batch.failed().len(),
        outstanding = batch.outstanding(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "compile round done"
    );
}
