use super::{GraphPass, PassResult};
use crate::device::KernelAttributes;
use crate::error::RuntimeResult;
use crate::graph::{Graph, Node};
use crate::ops::OpKind;

const SCALAR_ALIASES: [&str; 2] = ["alpha", "value"];

/// Normalizes builtin nodes so later passes can match them structurally:
/// canonical op names, `scalar` instead of its aliases, non-negative axes,
/// 0/1 `keepdim`, and commutative operands ordered by edge id.
pub struct CanonicalizePass;

impl CanonicalizePass {
    fn canonical_attrs(kind: OpKind, attrs: &KernelAttributes, rank: usize) -> KernelAttributes {
        let mut attrs = attrs.clone();
        match kind {
            OpKind::Scalar(_) if attrs.float("scalar").is_none() => {
                for alias in SCALAR_ALIASES {
                    let value = attrs
                        .floats
                        .remove(alias)
                        .or_else(|| attrs.ints.remove(alias).map(|v| v as f64));
                    if let Some(value) = value {
                        attrs.floats.insert("scalar".to_string(), value);
                        break;
                    }
                }
            }
            OpKind::Reduce(_) => {
                if let Some(axis) = attrs.int("axis") {
                    if axis < 0 && axis + rank as i64 >= 0 {
                        attrs.ints.insert("axis".to_string(), axis + rank as i64);
                    }
                }
                if let Some(keep) = attrs.int("keepdim") {
                    attrs.ints.insert("keepdim".to_string(), (keep != 0) as i64);
                }
            }
            _ => {}
        }
        attrs
    }

    fn rewrite(graph: &Graph, node: &Node, kind: OpKind) -> RuntimeResult<Node> {
        let rank = match node.inputs.first() {
            Some(e) => graph.edge(*e)?.meta.shape.len(),
            None => 0,
        };
        let mut inputs = node.inputs.clone();
        if let OpKind::Binary(op) = kind {
            if op.is_commutative() && inputs.len() == 2 && inputs[0] > inputs[1] {
                inputs.swap(0, 1);
            }
        }
        Ok(Node {
            id: node.id,
            op: kind.name().to_string(),
            attrs: Self::canonical_attrs(kind, &node.attrs, rank),
            inputs,
            outputs: node.outputs.clone(),
        })
    }
}

impl GraphPass for CanonicalizePass {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut result = PassResult::default();
        let ids: Vec<_> = graph.nodes().map(|n| n.id).collect();
        for id in ids {
            let node = graph.node(id)?;
            let Some(kind) = OpKind::lookup(&node.op) else {
                continue;
            };
            let canonical = Self::rewrite(graph, node, kind)?;
            if canonical.op != node.op || canonical.attrs != node.attrs || canonical.inputs != node.inputs {
                *graph.node_mut(id)? = canonical;
                result.changed = true;
                result.rewrites_applied += 1;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::graph::GraphBuilder;
    use crate::tensor::DType;
    use std::sync::Arc;

    #[test]
    fn test_names_and_attributes_normalized() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let x = builder.input(&[2, 3], DType::F32).unwrap();
        let y = builder
            .op("Multiply_Scalar", &[x], KernelAttributes::new().with_float("alpha", 0.5))
            .unwrap();
        let z = builder.op("mul_scalar", &[x], KernelAttributes::new().with_int("value", 3)).unwrap();
        let s = builder
            .op(
                "REDUCE_SUM",
                &[x],
                KernelAttributes::new().with_int("axis", -2).with_int("keepdim", 7),
            )
            .unwrap();
        builder.mark_output(y).unwrap();
        builder.mark_output(z).unwrap();
        builder.mark_output(s).unwrap();
        let mut graph = builder.build();

        let result = CanonicalizePass.run(&mut graph).unwrap();
        assert_eq!(result.rewrites_applied, 2);
        let nodes: Vec<_> = graph.nodes().cloned().collect();
        // "multiply_scalar" is not a known alias and stays opaque.
        assert_eq!(nodes[0].op, "Multiply_Scalar");
        assert_eq!(nodes[1].attrs.float("scalar"), Some(3.0));
        assert_eq!(nodes[1].attrs.int("value"), None);
        assert_eq!(nodes[2].op, "sum");
        assert_eq!(nodes[2].attrs.int("axis"), Some(0));
        assert_eq!(nodes[2].attrs.int("keepdim"), Some(1));

        assert!(!CanonicalizePass.run(&mut graph).unwrap().changed);
    }

    #[test]
    fn test_commutative_operands_sorted() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let a = builder.input(&[2], DType::F32).unwrap();
        let b = builder.input(&[2], DType::F32).unwrap();
        let add = builder.op("plus", &[b, a], KernelAttributes::new()).unwrap();
        let sub = builder.op("sub", &[b, a], KernelAttributes::new()).unwrap();
        let max = builder.op("maximum", &[b, a], KernelAttributes::new()).unwrap();
        for e in [add, sub, max] {
            builder.mark_output(e).unwrap();
        }
        let mut graph = builder.build();
        CanonicalizePass.run(&mut graph).unwrap();

        let nodes: Vec<_> = graph.nodes().cloned().collect();
        assert_eq!(nodes[0].op, "add");
        assert_eq!(nodes[0].inputs, vec![a, b]);
        assert_eq!(nodes[1].inputs, vec![b, a]);
        assert_eq!(nodes[2].inputs, vec![b, a]);
    }
}
