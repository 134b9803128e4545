use std::collections::HashSet;

use super::{GraphPass, PassResult};
use crate::error::RuntimeResult;
use crate::graph::{EdgeId, EdgeKind, Graph};
use crate::ops::OpKind;

/// Removes nodes and edges that no declared output depends on.
///
/// Liveness starts from the graph outputs and walks producers backwards.
/// Graph inputs are never removed, even when unused, so callers can keep
/// binding them by position. Builtin nodes also lose any extra output edge
/// nothing reads; custom nodes keep all of theirs.
pub struct DeadCodeEliminationPass;

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut live_edges: HashSet<EdgeId> = HashSet::new();
        let mut live_nodes = HashSet::new();
        let mut worklist: Vec<EdgeId> = graph.outputs().to_vec();
        while let Some(edge) = worklist.pop() {
            if !live_edges.insert(edge) {
                continue;
            }
            if let Some(producer) = graph.edge(edge)?.producer {
                if live_nodes.insert(producer) {
                    let node = graph.node(producer)?;
                    worklist.extend(node.inputs.iter().copied());
                    // Custom nodes write every output they were given.
                    if OpKind::lookup(&node.op).is_none() {
                        worklist.extend(node.outputs.iter().copied());
                    } else {
                        worklist.extend(node.outputs.first().copied());
                    }
                }
            }
        }

        let mut result = PassResult::default();
        let dead_nodes: Vec<_> = graph.nodes().map(|n| n.id).filter(|id| !live_nodes.contains(id)).collect();
        for id in dead_nodes {
            graph.remove_node(id)?;
            result.erased_nodes += 1;
        }

        for id in live_nodes {
            let node = graph.node(id)?;
            if node.outputs.len() > 1 && OpKind::lookup(&node.op).is_some() {
                let kept: Vec<EdgeId> = node
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(i, e)| *i == 0 || live_edges.contains(e))
                    .map(|(_, e)| *e)
                    .collect();
                if kept.len() != node.outputs.len() {
                    let dropped: Vec<EdgeId> = node.outputs.iter().filter(|e| !kept.contains(e)).copied().collect();
                    graph.node_mut(id)?.outputs = kept;
                    for e in dropped {
                        graph.edge_mut(e)?.producer = None;
                    }
                    result.rewrites_applied += 1;
                }
            }
        }

        let dead_edges: Vec<EdgeId> = graph
            .edges()
            .filter(|e| e.kind != EdgeKind::Input && !live_edges.contains(&e.id))
            .map(|e| e.id)
            .collect();
        for id in dead_edges {
            graph.remove_edge(id)?;
            result.erased_edges += 1;
        }

        result.changed = result.erased_nodes > 0 || result.erased_edges > 0 || result.rewrites_applied > 0;
        Ok(result)
    }
}
