// graph.rs — Operator graph as seen by the compile scheduler
//
// The graph owns its nodes; the scheduler only ever holds `NodeId`s into it
// during a pass. Nodes carry identity (name, op type, owning subgraph), the
// scope assignment produced by the upstream fusion passes, the fusion-origin
// tag of that scope, optional thread-slice metadata, and an open attribute
// map for the markers and compiler metadata the scheduler writes back.
//
// Preconditions: node ids are positions in `Graph::nodes`.
// Postconditions: none (data model only).
// Failure modes: lookups of unknown ids return `SchedulerError::UnknownNode`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::id::{NodeId, ScopeId};

/// Attribute keys read or written by the scheduler.
pub mod attr {
    /// Stamped on demoted nodes: the fused scope they failed to compile in.
    pub const FUSION_FAILED_WITH_SCOPE: &str = "fusion_failed_with_scope";
    /// List of attribute names to drop when the node is de-fused.
    pub const ROLLBACK_ATTRS: &str = "rollback_attrs";
    /// Rollback-listed attribute that also implies clearing output reuse flags.
    pub const REUSE_INPUT: &str = "reuse_input";
    pub const KERNEL_PATH: &str = "kernel_path";
    pub const COMPILE_INFO_JSON: &str = "compile_info_json";
    pub const COMPILE_INFO_KEY: &str = "compile_info_key";
    pub const SLICE_KERNEL_PATHS: &str = "slice_kernel_paths";
    pub const UNSUPPORT_DYNAMIC_SHAPE: &str = "unsupport_dynamic_shape";
    pub const NEED_RECOMPILE: &str = "need_recompile";
}

// ── Node data ───────────────────────────────────────────────────────────────

/// What a node is, as far as compilation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Op,
    Data,
    Placeholder,
    End,
    Const,
    /// A fused node whose kernel was already produced.
    CompiledFused,
}

impl NodeKind {
    pub fn is_compilable(self) -> bool {
        matches!(self, NodeKind::Op)
    }
}

/// Which upstream pass produced the node's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionOrigin {
    #[default]
    None,
    L1,
    Buffer,
}

/// A sub-range of one tensor for one slice.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TensorRange {
    pub offset: Vec<i64>,
    pub extent: Vec<i64>,
}

/// Thread-slice metadata: one entry per slice, each listing the sub-range of
/// every input (resp. output) tensor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceInfo {
    #[serde(default)]
    pub auto_thread: bool,
    #[serde(default)]
    pub input_ranges: Vec<Vec<TensorRange>>,
    #[serde(default)]
    pub output_ranges: Vec<Vec<TensorRange>>,
}

impl SliceInfo {
    pub fn slice_count(&self) -> usize {
        self.input_ranges.len().max(self.output_ranges.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<i64>,
    /// Shape of the slice currently being compiled, if any.
    #[serde(default)]
    pub slice_shape: Option<Vec<i64>>,
    #[serde(default)]
    pub reuse_input: bool,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        TensorDesc {
            name: name.into(),
            shape,
            slice_shape: None,
            reuse_input: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Str(s) => write!(f, "{s:?}"),
            AttrValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// An operator in the compute graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default = "unassigned_node_id", skip_serializing)]
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub op_type: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub subgraph_id: u32,
    #[serde(default)]
    pub scope_id: Option<ScopeId>,
    #[serde(default)]
    pub fusion_origin: FusionOrigin,
    /// Op supports shape-generalized ("fuzzy") builds.
    #[serde(default)]
    pub fuzzy_build: bool,
    #[serde(default)]
    pub slice: Option<SliceInfo>,
    #[serde(default)]
    pub inputs: Vec<TensorDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

fn unassigned_node_id() -> NodeId {
    NodeId(u32::MAX)
}

impl Node {
    /// A compilable op node with no scope, fusion tag or slices.
    pub fn op(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Node {
            id: unassigned_node_id(),
            name: name.into(),
            op_type: op_type.into(),
            kind: NodeKind::Op,
            subgraph_id: 0,
            scope_id: None,
            fusion_origin: FusionOrigin::None,
            fuzzy_build: false,
            slice: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn in_scope(mut self, scope: i64) -> Self {
        self.scope_id = Some(ScopeId(scope));
        self
    }

    pub fn in_subgraph(mut self, subgraph_id: u32) -> Self {
        self.subgraph_id = subgraph_id;
        self
    }

    pub fn with_origin(mut self, origin: FusionOrigin) -> Self {
        self.fusion_origin = origin;
        self
    }

    pub fn with_slices(mut self, slice: SliceInfo) -> Self {
        self.slice = Some(slice);
        self
    }

    pub fn with_fuzzy_build(mut self) -> Self {
        self.fuzzy_build = true;
        self
    }

    pub fn with_input(mut self, tensor: TensorDesc) -> Self {
        self.inputs.push(tensor);
        self
    }

    pub fn with_output(mut self, tensor: TensorDesc) -> Self {
        self.outputs.push(tensor);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// True when the node takes part in auto-thread sliced compilation.
    pub fn has_auto_thread_slices(&self) -> bool {
        self.slice.as_ref().is_some_and(|s| s.auto_thread)
    }

    pub fn bool_attr(&self, key: &str) -> bool {
        matches!(self.attrs.get(key), Some(AttrValue::Bool(true)))
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int_attr(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn list_attr(&self, key: &str) -> &[String] {
        match self.attrs.get(key) {
            Some(AttrValue::List(items)) => items,
            _ => &[],
        }
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from nodes, assigning ids in order.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut graph = Graph::new();
        for node in nodes {
            graph.add_node(node);
        }
        graph
    }

    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        node.id = id;
        self.nodes.push(node);
        id
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, SchedulerError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(SchedulerError::UnknownNode { node: id })
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, SchedulerError> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(SchedulerError::UnknownNode { node: id })
    }

    /// Owning subgraph of a node.
    pub fn owner_subgraph(&self, id: NodeId) -> Result<u32, SchedulerError> {
        Ok(self.node(id)?.subgraph_id)
    }

    pub fn set_attr(
        &mut self,
        id: NodeId,
        key: &str,
        value: AttrValue,
    ) -> Result<(), SchedulerError> {
        self.node_mut(id)?.attrs.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_attr(
        &mut self,
        id: NodeId,
        key: &str,
    ) -> Result<Option<AttrValue>, SchedulerError> {
        Ok(self.node_mut(id)?.attrs.remove(key))
    }

    pub fn set_scope(&mut self, id: NodeId, scope: ScopeId) -> Result<(), SchedulerError> {
        self.node_mut(id)?.scope_id = Some(scope);
        Ok(())
    }
}
