// scope.rs — Scope grouping of compilable nodes
//
// Partitions the compilable nodes of a (sub)graph into scopes: the fused
// groups assigned by the upstream fusion passes, plus one singleton scope
// with a private negative id for every node without a fusion group.
//
// Preconditions: every compilable node has a name and an op type.
// Postconditions: every selected node belongs to exactly one scope; no scope
//                 id 0 is emitted; singleton ids are written back to the graph.
// Failure modes: missing identity → `SchedulerError::MissingIdentity` (fatal).
// Side effects: rewrites `scope_id` of nodes that received a singleton scope.

use std::collections::{BTreeMap, HashSet};

use crate::error::SchedulerError;
use crate::graph::{attr, Graph, Node};
use crate::id::{NodeId, ScopeId, ScopeIdAllocator};
use crate::options::ScopePolicy;

// ── Scope group ─────────────────────────────────────────────────────────────

/// Mapping from scope id to the ordered nodes compiled together in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeGroup {
    scopes: BTreeMap<ScopeId, Vec<NodeId>>,
}

impl ScopeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, scope: ScopeId, node: NodeId) {
        self.scopes.entry(scope).or_default().push(node);
    }

    pub fn insert(&mut self, scope: ScopeId, nodes: Vec<NodeId>) -> Option<Vec<NodeId>> {
        self.scopes.insert(scope, nodes)
    }

    pub fn remove(&mut self, scope: ScopeId) -> Option<Vec<NodeId>> {
        self.scopes.remove(&scope)
    }

    pub fn get(&self, scope: ScopeId) -> Option<&[NodeId]> {
        self.scopes.get(&scope).map(Vec::as_slice)
    }

    /// Like `get`, but a missing scope is a bookkeeping error.
    pub fn nodes(&self, scope: ScopeId) -> Result<&[NodeId], SchedulerError> {
        self.get(scope).ok_or(SchedulerError::UnknownScope { scope })
    }

    pub fn contains(&self, scope: ScopeId) -> bool {
        self.scopes.contains_key(&scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScopeId, &[NodeId])> {
        self.scopes.iter().map(|(id, nodes)| (*id, nodes.as_slice()))
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.scopes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.scopes.values().map(Vec::len).sum()
    }

    pub fn scope_of(&self, node: NodeId) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|(_, nodes)| nodes.contains(&node))
            .map(|(id, _)| *id)
    }

    pub fn as_map(&self) -> &BTreeMap<ScopeId, Vec<NodeId>> {
        &self.scopes
    }
}

impl FromIterator<(ScopeId, Vec<NodeId>)> for ScopeGroup {
    fn from_iter<T: IntoIterator<Item = (ScopeId, Vec<NodeId>)>>(iter: T) -> Self {
        ScopeGroup {
            scopes: iter.into_iter().collect(),
        }
    }
}

// ── Grouping ────────────────────────────────────────────────────────────────

/// Group the compilable nodes of `graph` into scopes.
///
/// Nodes already carrying a non-zero scope id keep it. Nodes without one (or
/// with the reserved id 0) each get a fresh negative singleton scope from
/// `alloc`, which is first pushed below every id already in the graph.
pub fn group_scopes(
    graph: &mut Graph,
    policy: ScopePolicy,
    alloc: &mut ScopeIdAllocator,
) -> Result<ScopeGroup, SchedulerError> {
    for node in graph.nodes() {
        if let Some(scope) = node.scope_id {
            alloc.reserve_below(scope);
        }
    }

    let mut selected = Vec::new();
    for node in graph.nodes() {
        if !node.kind.is_compilable() {
            continue;
        }
        if policy == ScopePolicy::OnlyNeedsRecompile && !node.bool_attr(attr::NEED_RECOMPILE) {
            continue;
        }
        check_identity(node)?;
        selected.push((node.id, node.scope_id));
    }

    let mut group = ScopeGroup::new();
    for (id, scope) in selected {
        match scope {
            Some(scope) if scope.0 != 0 => group.push(scope, id),
            _ => {
                let fresh = alloc.alloc()?;
                graph.set_scope(id, fresh)?;
                group.push(fresh, id);
            }
        }
    }
    Ok(group)
}

pub(crate) fn check_identity(node: &Node) -> Result<(), SchedulerError> {
    if node.name.is_empty() {
        return Err(SchedulerError::MissingIdentity {
            node: node.id,
            missing: "name",
        });
    }
    if node.op_type.is_empty() {
        return Err(SchedulerError::MissingIdentity {
            node: node.id,
            missing: "op_type",
        });
    }
    Ok(())
}

// ── Verification ────────────────────────────────────────────────────────────

/// Checkable evidence for scope group invariants (G1-G3).
#[derive(Debug, Clone)]
pub struct ScopeGroupCert {
    /// G1: no node appears in two scopes (or twice in one).
    pub g1_nodes_unique: bool,
    /// G2: scope 0 never holds more than one node.
    pub g2_no_multi_node_zero_scope: bool,
    /// G3: no scope is empty.
    pub g3_no_empty_scope: bool,
}

impl ScopeGroupCert {
    pub fn all_pass(&self) -> bool {
        self.g1_nodes_unique && self.g2_no_multi_node_zero_scope && self.g3_no_empty_scope
    }

    pub fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("G1_nodes_unique", self.g1_nodes_unique),
            ("G2_no_multi_node_zero_scope", self.g2_no_multi_node_zero_scope),
            ("G3_no_empty_scope", self.g3_no_empty_scope),
        ]
    }

    /// Fatal error naming every failed obligation, if any.
    pub fn into_result(self) -> Result<(), SchedulerError> {
        if self.all_pass() {
            return Ok(());
        }
        let failed: Vec<_> = self
            .obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect();
        Err(SchedulerError::InvalidScopeGroup {
            failed: failed.join(", "),
        })
    }
}

pub fn verify_scope_group(group: &ScopeGroup) -> ScopeGroupCert {
    let mut seen = HashSet::with_capacity(group.node_count());
    let g1 = group
        .iter()
        .flat_map(|(_, nodes)| nodes.iter())
        .all(|node| seen.insert(*node));
    let g2 = group.get(ScopeId(0)).map_or(true, |nodes| nodes.len() <= 1);
    let g3 = group.iter().all(|(_, nodes)| !nodes.is_empty());
    ScopeGroupCert {
        g1_nodes_unique: g1,
        g2_no_multi_node_zero_scope: g2,
        g3_no_empty_scope: g3,
    }
}
