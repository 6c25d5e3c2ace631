// retry.rs — Retry state and de-fusion of failed scopes
//
// A failed plain scope is demoted: every one of its nodes moves into a fresh
// single-op scope with a private negative id, loses its rollback-listed
// attributes, and is stamped with the scope it failed in. The demoted scopes
// are resubmitted exactly once with the ordinary strategy.
//
// Scheduler-internal progress lives in `RetryContext`, threaded through the
// rounds of one call; the graph only sees the writes listed above.
//
// Preconditions: every scope passed to `demote` is still in the scope group.
// Postconditions: demoted scopes are erased from the group and replaced by
//                 one singleton scope per node.
// Failure modes: scope id exhaustion, unknown scopes/nodes (fatal).
// Side effects: rewrites scope ids and attributes of demoted nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::batch::{CompileBatch, CompileMetadata};
use crate::diag::{codes, DiagLevel, Diagnostic, OpRef};
use crate::error::SchedulerError;
use crate::graph::{attr, AttrValue, Graph};
use crate::id::{NodeId, ScopeId, ScopeIdAllocator};
use crate::options::{CompileStrategy, SchedulerOptions};
use crate::scope::ScopeGroup;

// ── Retry context ───────────────────────────────────────────────────────────

/// Upstream layer a failed scope is handed back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackLayer {
    L1Fusion,
    BufferFusion,
}

impl fmt::Display for RollbackLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackLayer::L1Fusion => write!(f, "L1 fusion"),
            RollbackLayer::BufferFusion => write!(f, "buffer fusion"),
        }
    }
}

/// Where one node stands within the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Succeeded(CompileMetadata),
    Demoted(ScopeId),
    RolledBackTo(RollbackLayer),
    Failed,
}

/// Decision taken for a failed scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeVerdict {
    RolledBack(RollbackLayer),
    Retry,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryContext {
    strategy: CompileStrategy,
    round: u32,
    states: BTreeMap<NodeId, NodeState>,
    previous_scope: BTreeMap<NodeId, ScopeId>,
    verdicts: BTreeMap<ScopeId, ScopeVerdict>,
    attempted: BTreeSet<ScopeId>,
}

impl RetryContext {
    pub fn new(strategy: CompileStrategy) -> Self {
        RetryContext {
            strategy,
            round: 0,
            states: BTreeMap::new(),
            previous_scope: BTreeMap::new(),
            verdicts: BTreeMap::new(),
            attempted: BTreeSet::new(),
        }
    }

    /// Mark every node of `scopes` pending and remember its scope.
    pub fn seed(&mut self, scopes: &ScopeGroup) {
        for (scope, nodes) in scopes.iter() {
            for node in nodes {
                self.states.insert(*node, NodeState::Pending);
                self.previous_scope.insert(*node, scope);
            }
        }
    }

    pub fn strategy(&self) -> CompileStrategy {
        self.strategy
    }

    /// Tuning overrides do not survive into a retry round.
    pub fn retry_strategy(&self) -> CompileStrategy {
        CompileStrategy::Default
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn begin_round(&mut self) -> u32 {
        self.round += 1;
        self.round
    }

    pub fn state(&self, node: NodeId) -> Option<&NodeState> {
        self.states.get(&node)
    }

    pub fn set_state(&mut self, node: NodeId, state: NodeState) {
        self.states.insert(node, state);
    }

    pub fn states(&self) -> &BTreeMap<NodeId, NodeState> {
        &self.states
    }

    /// Scope a node was in before this call touched it.
    pub fn previous_scope(&self, node: NodeId) -> Option<ScopeId> {
        self.previous_scope.get(&node).copied()
    }

    pub fn verdict(&self, scope: ScopeId) -> Option<ScopeVerdict> {
        self.verdicts.get(&scope).copied()
    }

    pub fn record_verdict(&mut self, scope: ScopeId, verdict: ScopeVerdict) {
        self.verdicts.insert(scope, verdict);
    }

    /// Carry the batch's retried-slice-scope flags into the next round.
    pub fn absorb(&mut self, batch: &CompileBatch) {
        self.attempted.extend(batch.deletion_attempted().iter().copied());
    }

    pub fn attempted(&self) -> &BTreeSet<ScopeId> {
        &self.attempted
    }

    /// Fresh scopes split off a retried slice scope count as retried too.
    pub fn inherit_attempt(&mut self, from: ScopeId, to: &[ScopeId]) {
        if self.attempted.contains(&from) {
            self.attempted.extend(to.iter().copied());
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────────────────

/// Why a retry round was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    TuningStep,
    FuzzyOnline,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::TuningStep => write!(f, "tuning step needs no recovery"),
            SuppressReason::FuzzyOnline => write!(f, "online fuzzy builds are not retried"),
        }
    }
}

/// One failed scope and the singleton scopes its nodes moved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Demotion {
    pub from: ScopeId,
    pub to: Vec<ScopeId>,
}

pub struct RetryCoordinator {
    alloc: ScopeIdAllocator,
    tuning_without_recovery: bool,
}

impl RetryCoordinator {
    pub fn new(options: &SchedulerOptions, alloc: ScopeIdAllocator) -> Self {
        RetryCoordinator {
            alloc,
            tuning_without_recovery: options.tuning_without_recovery(),
        }
    }

    /// Policy gates checked before any demotion.
    pub fn gate(&self, strategy: CompileStrategy) -> Option<SuppressReason> {
        if self.tuning_without_recovery {
            return Some(SuppressReason::TuningStep);
        }
        if strategy == CompileStrategy::FuzzyOnline {
            return Some(SuppressReason::FuzzyOnline);
        }
        None
    }

    /// De-fuse every scope in `failed` into single-op scopes.
    pub fn demote(
        &mut self,
        graph: &mut Graph,
        scopes: &mut ScopeGroup,
        failed: &[ScopeId],
        ctx: &mut RetryContext,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<Vec<Demotion>, SchedulerError> {
        let mut demotions = Vec::with_capacity(failed.len());
        for &scope in failed {
            let nodes = scopes
                .get(scope)
                .ok_or(SchedulerError::UnknownScope { scope })?
                .to_vec();
            let mut fresh = Vec::with_capacity(nodes.len());
            for &node in &nodes {
                let new_scope = self.alloc.alloc()?;
                strip_rollback_attrs(graph, node)?;
                graph.set_attr(node, attr::FUSION_FAILED_WITH_SCOPE, AttrValue::Int(scope.0))?;
                graph.set_scope(node, new_scope)?;
                scopes.insert(new_scope, vec![node]);
                ctx.set_state(node, NodeState::Demoted(new_scope));
                fresh.push(new_scope);
            }
            scopes.remove(scope);
            ctx.inherit_attempt(scope, &fresh);

            warn!(
                scope_id = scope.0,
                nodes = nodes.len(),
                "fused scope failed to compile, de-fusing for retry"
            );
            let mut diag = Diagnostic::new(
                DiagLevel::Warning,
                format!("scope {} de-fused into {} single-op scope(s)", scope, fresh.len()),
            )
            .with_code(codes::W0104);
            if let Some(first) = nodes.first() {
                diag = diag.with_op(OpRef::of(graph.node(*first)?));
            }
            diags.push(diag);
            demotions.push(Demotion {
                from: scope,
                to: fresh,
            });
        }
        Ok(demotions)
    }
}

fn strip_rollback_attrs(graph: &mut Graph, id: NodeId) -> Result<(), SchedulerError> {
    let listed = graph.node(id)?.list_attr(attr::ROLLBACK_ATTRS).to_vec();
    for key in &listed {
        graph.remove_attr(id, key)?;
    }
    if listed.iter().any(|k| k == attr::REUSE_INPUT) {
        for tensor in graph.node_mut(id)?.outputs.iter_mut() {
            tensor.reuse_input = false;
        }
    }
    Ok(())
}
