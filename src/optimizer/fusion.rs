use super::{GraphPass, PassResult};
use crate::device::KernelAttributes;
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{EdgeId, Graph, Node, NodeId};
use crate::ops::schema::FUSED_ELEMENTWISE;
use crate::ops::{FusedChain, OpKind};

/// Merges producer/consumer pairs of elementwise nodes into one
/// `fused_elementwise` node carrying its program as JSON in attr `program`.
///
/// A pair fuses only when every tensor involved has the consumer's exact
/// shape and dtype, the connecting edge has no other reader and is not a
/// graph output, and the merged program stays within `max_depth` steps.
/// The program keeps the original step order, so results are unchanged.
pub struct ElementwiseFusionPass {
    max_depth: usize,
}

impl ElementwiseFusionPass {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// The program a node computes, if it is a shape-preserving elementwise node
    fn chain_of(graph: &Graph, node: &Node) -> RuntimeResult<Option<FusedChain>> {
        let [out] = node.outputs[..] else {
            return Ok(None);
        };
        let chain = if node.op == FUSED_ELEMENTWISE {
            let program = node.attrs.string("program").ok_or_else(|| {
                RuntimeError::InvalidGraph(format!("{} has no fused program", node.id))
            })?;
            FusedChain::from_json(program)?
        } else {
            match OpKind::lookup(&node.op) {
                Some(kind) if kind.is_elementwise() => match kind.elementwise(&node.attrs)? {
                    Some(op) => FusedChain::single(op),
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        };
        let meta = &graph.edge(out)?.meta;
        for input in &node.inputs {
            if graph.edge(*input)?.meta != *meta {
                return Ok(None);
            }
        }
        Ok(Some(chain))
    }

    fn try_fuse(&self, graph: &mut Graph, consumer_id: NodeId) -> RuntimeResult<bool> {
        let consumer = graph.node(consumer_id)?.clone();
        let Some(consumer_chain) = Self::chain_of(graph, &consumer)? else {
            return Ok(false);
        };

        let mut seen: Vec<EdgeId> = Vec::new();
        for &via in &consumer.inputs {
            if seen.contains(&via) {
                continue;
            }
            seen.push(via);

            let Some(producer_id) = graph.edge(via)?.producer else {
                continue;
            };
            if graph.is_output(via) || graph.consumers(via) != [consumer_id] {
                continue;
            }
            let producer = graph.node(producer_id)?.clone();
            let Some(producer_chain) = Self::chain_of(graph, &producer)? else {
                continue;
            };
            if producer_chain.len() + consumer_chain.len() > self.max_depth {
                continue;
            }

            let (chain, inputs) = FusedChain::compose(
                &producer_chain,
                &producer.inputs,
                &consumer_chain,
                &consumer.inputs,
                via,
            )?;
            let attrs = KernelAttributes::new()
                .with_string("program", &chain.to_json()?)
                .with_int("steps", chain.len() as i64);

            graph.remove_node(producer_id)?;
            let node = graph.node_mut(consumer_id)?;
            node.op = FUSED_ELEMENTWISE.to_string();
            node.attrs = attrs;
            node.inputs = inputs;
            graph.remove_edge(via)?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl GraphPass for ElementwiseFusionPass {
    fn name(&self) -> &'static str {
        "elementwise-fusion"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut result = PassResult::default();
        loop {
            let mut fused = false;
            for id in graph.topo_order()? {
                if self.try_fuse(graph, id)? {
                    fused = true;
                    break;
                }
            }
            if !fused {
                break;
            }
            result.changed = true;
            result.rewrites_applied += 1;
            result.erased_nodes += 1;
            result.erased_edges += 1;
        }
        Ok(result)
    }
}
