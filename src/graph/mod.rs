//! Deferred computation graphs.
//!
//! Nodes and edges live in arenas indexed by stable ids. Removing an element
//! empties its slot; ids are never reused. Acyclicity is enforced when nodes
//! are inserted: a node may only read edges that already exist and may only
//! produce fresh, unread edges.

pub mod builder;

pub use builder::GraphBuilder;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::device::{Device, KernelAttributes};
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::{DType, Tensor, TensorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Bound by the caller before every execution
    Input,
    /// Known at compile time
    Constant,
    /// Produced by a node
    Intermediate,
}

/// A tensor-valued graph value, materialized or not yet
#[derive(Debug)]
pub struct Edge {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub meta: TensorMeta,
    pub tensor: Option<Tensor>,
    pub producer: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: String,
    pub attrs: KernelAttributes,
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
}

/// Slot assignment for intermediate edges, produced by memory planning
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPlan {
    /// Element type and element count of each shared slot
    pub slots: Vec<(DType, usize)>,
    pub assignments: BTreeMap<EdgeId, usize>,
    pub bytes_without_reuse: usize,
    pub bytes_with_reuse: usize,
}

impl MemoryPlan {
    pub fn slot_of(&self, edge: EdgeId) -> Option<usize> {
        self.assignments.get(&edge).copied()
    }
}

pub struct Graph {
    device: Arc<Device>,
    edges: Vec<Option<Edge>>,
    nodes: Vec<Option<Node>>,
    inputs: Vec<EdgeId>,
    outputs: Vec<EdgeId>,
    memory_plan: Option<MemoryPlan>,
}

impl Graph {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            edges: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            memory_plan: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn inputs(&self) -> &[EdgeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[EdgeId] {
        &self.outputs
    }

    pub fn memory_plan(&self) -> Option<&MemoryPlan> {
        self.memory_plan.as_ref()
    }

    pub fn set_memory_plan(&mut self, plan: Option<MemoryPlan>) {
        self.memory_plan = plan;
    }

    pub(crate) fn add_edge(&mut self, kind: EdgeKind, meta: TensorMeta, tensor: Option<Tensor>) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Some(Edge {
            id,
            kind,
            meta,
            tensor,
            producer: None,
        }));
        if kind == EdgeKind::Input {
            self.inputs.push(id);
        }
        id
    }

    /// Insert a node reading existing edges and producing fresh ones
    pub fn add_node(
        &mut self,
        op: &str,
        inputs: &[EdgeId],
        outputs: &[EdgeId],
        attrs: KernelAttributes,
    ) -> RuntimeResult<NodeId> {
        for input in inputs {
            self.edge(*input)?;
        }
        let mut seen = HashSet::new();
        for output in outputs {
            let edge = self.edge(*output)?;
            if edge.kind != EdgeKind::Intermediate {
                return Err(RuntimeError::InvalidGraph(format!("{} is not an intermediate edge", output)));
            }
            if let Some(p) = edge.producer {
                return Err(RuntimeError::InvalidGraph(format!("{} is already produced by {}", output, p)));
            }
            if inputs.contains(output) || !seen.insert(*output) {
                return Err(RuntimeError::InvalidGraph(format!("{} would form a cycle", output)));
            }
            if !self.consumers(*output).is_empty() {
                return Err(RuntimeError::InvalidGraph(format!(
                    "{} is already read by another node",
                    output
                )));
            }
        }

        let id = NodeId(self.nodes.len());
        for output in outputs {
            self.edge_mut(*output)?.producer = Some(id);
        }
        self.nodes.push(Some(Node {
            id,
            op: op.to_string(),
            attrs,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        }));
        Ok(id)
    }

    pub fn mark_output(&mut self, edge: EdgeId) -> RuntimeResult<()> {
        self.edge(edge)?;
        if !self.outputs.contains(&edge) {
            self.outputs.push(edge);
        }
        Ok(())
    }

    pub fn edge(&self, id: EdgeId) -> RuntimeResult<&Edge> {
        self.edges
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("edge {} does not exist", id)))
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> RuntimeResult<&mut Edge> {
        self.edges
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("edge {} does not exist", id)))
    }

    pub fn node(&self, id: NodeId) -> RuntimeResult<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("node {} does not exist", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> RuntimeResult<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("node {} does not exist", id)))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn num_edges(&self) -> usize {
        self.edges().count()
    }

    pub fn is_output(&self, edge: EdgeId) -> bool {
        self.outputs.contains(&edge)
    }

    /// Nodes reading `edge`, each listed once
    pub fn consumers(&self, edge: EdgeId) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.inputs.contains(&edge))
            .map(|n| n.id)
            .collect()
    }

    /// Live nodes in dependency order, ties broken by insertion order
    pub fn topo_order(&self) -> RuntimeResult<Vec<NodeId>> {
        let mut indegree: BTreeMap<NodeId, usize> = BTreeMap::new();
        for node in self.nodes() {
            let deps: HashSet<NodeId> = node
                .inputs
                .iter()
                .filter_map(|e| self.edge(*e).ok().and_then(|edge| edge.producer))
                .collect();
            indegree.insert(node.id, deps.len());
        }

        let mut ready: VecDeque<NodeId> = indegree.iter().filter(|(_, &d)| d == 0).map(|(&n, _)| n).collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let node = self.node(id)?;
            let mut released = HashSet::new();
            for output in &node.outputs {
                for consumer in self.consumers(*output) {
                    if released.insert(consumer) {
                        if let Some(d) = indegree.get_mut(&consumer) {
                            *d -= 1;
                            if *d == 0 {
                                ready.push_back(consumer);
                            }
                        }
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            return Err(RuntimeError::InvalidGraph("graph contains a cycle".to_string()));
        }
        Ok(order)
    }

    /// Remove a node; its outputs stay in the graph without a producer
    pub fn remove_node(&mut self, id: NodeId) -> RuntimeResult<Node> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("node {} does not exist", id)))?;
        for output in &node.outputs {
            if let Ok(edge) = self.edge_mut(*output) {
                edge.producer = None;
            }
        }
        Ok(node)
    }

    /// Remove an edge nothing reads and nothing produces
    pub fn remove_edge(&mut self, id: EdgeId) -> RuntimeResult<Edge> {
        if !self.consumers(id).is_empty() || self.is_output(id) {
            return Err(RuntimeError::InvalidGraph(format!("{} is still in use", id)));
        }
        if let Some(p) = self.edge(id)?.producer {
            return Err(RuntimeError::InvalidGraph(format!("{} is still produced by {}", id, p)));
        }
        let edge = self.edges[id.0]
            .take()
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("edge {} does not exist", id)))?;
        self.inputs.retain(|e| *e != id);
        Ok(edge)
    }

    /// Shapes and dtypes of the declared outputs, in order
    pub fn output_signature(&self) -> RuntimeResult<Vec<TensorMeta>> {
        self.outputs.iter().map(|e| Ok(self.edge(*e)?.meta.clone())).collect()
    }

    /// Edge metas of a node's inputs
    pub fn input_metas(&self, node: &Node) -> RuntimeResult<Vec<TensorMeta>> {
        node.inputs.iter().map(|e| Ok(self.edge(*e)?.meta.clone())).collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph on {} ({} nodes, {} edges)", self.device.id(), self.num_nodes(), self.num_edges())?;
        for edge in self.edges() {
            match edge.kind {
                EdgeKind::Input => writeln!(f, "  input {}: {}", edge.id, edge.meta)?,
                EdgeKind::Constant => writeln!(f, "  const {}: {}", edge.id, edge.meta)?,
                EdgeKind::Intermediate => {}
            }
        }
        let order = self.topo_order().map_err(|_| fmt::Error)?;
        for id in order {
            let node = self.node(id).map_err(|_| fmt::Error)?;
            let outs: Vec<String> = node.outputs.iter().map(|e| e.to_string()).collect();
            let ins: Vec<String> = node.inputs.iter().map(|e| e.to_string()).collect();
            write!(f, "  {} = {}({})", outs.join(", "), node.op, ins.join(", "))?;
            if !node.attrs.is_empty() {
                write!(f, " {}", node.attrs)?;
            }
            writeln!(f)?;
        }
        let outs: Vec<String> = self.outputs.iter().map(|e| e.to_string()).collect();
        write!(f, "  return {}", outs.join(", "))
    }
}
