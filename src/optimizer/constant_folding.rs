use tracing::warn;

use super::{GraphPass, PassResult};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{EdgeKind, Graph};
use crate::ops::OpKind;
use crate::tensor::Tensor;

/// Evaluates builtin nodes whose inputs are all constants, using the graph
/// device's own kernels, and turns their output into a constant edge.
///
/// Nodes are visited in topological order, so whole constant subgraphs
/// collapse in one run. The folded node is removed; the inputs it read are
/// left for dead-code elimination.
pub struct ConstantFoldingPass;

impl GraphPass for ConstantFoldingPass {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut result = PassResult::default();
        let device = graph.device().clone();
        for id in graph.topo_order()? {
            let node = graph.node(id)?.clone();
            let Some(kind) = OpKind::lookup(&node.op) else {
                continue;
            };
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for e in &node.inputs {
                let edge = graph.edge(*e)?;
                match (&edge.kind, &edge.tensor) {
                    (EdgeKind::Constant, Some(t)) => inputs.push(t.shallow_clone()),
                    _ => break,
                }
            }
            if inputs.len() != node.inputs.len() {
                continue;
            }
            let Some(&out_id) = node.outputs.first() else {
                continue;
            };

            let meta = graph.edge(out_id)?.meta.clone();
            let mut outputs = [Tensor::zeros(&meta.shape, meta.dtype, &device)?];
            match device.run_kernel(kind.name(), &inputs, &mut outputs, &node.attrs) {
                Ok(()) => {}
                Err(RuntimeError::UnknownKernel { .. }) => {
                    warn!(node = %id, op = %node.op, "no kernel to fold with, leaving node in place");
                    continue;
                }
                Err(e) => return Err(e),
            }
            let [value] = outputs;

            graph.remove_node(id)?;
            let edge = graph.edge_mut(out_id)?;
            edge.kind = EdgeKind::Constant;
            edge.tensor = Some(value);
            result.changed = true;
            result.rewrites_applied += 1;
            result.erased_nodes += 1;
        }
        Ok(result)
    }
}
