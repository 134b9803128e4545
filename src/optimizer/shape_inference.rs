use super::{GraphPass, PassResult};
use crate::error::{ErrorContext, RuntimeError, RuntimeResult, WithContext};
use crate::graph::Graph;
use crate::ops::OpKind;

/// Propagates shapes and dtypes through every builtin node.
///
/// Builtin ops produce exactly one value: the first output edge takes the
/// inferred metadata and any stale builder allocation is dropped. A builtin
/// node whose extra output edges are read somewhere is malformed. Custom ops
/// keep the metadata the builder gave them.
pub struct ShapeInferencePass;

impl GraphPass for ShapeInferencePass {
    fn name(&self) -> &'static str {
        "shape-inference"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut result = PassResult::default();
        for id in graph.topo_order()? {
            let node = graph.node(id)?.clone();
            let Some(kind) = OpKind::lookup(&node.op) else {
                continue;
            };
            let first = *node.outputs.first().ok_or_else(|| {
                RuntimeError::InvalidGraph(format!("{} '{}' has no outputs", node.id, node.op))
            })?;
            for extra in &node.outputs[1..] {
                if graph.is_output(*extra) || !graph.consumers(*extra).is_empty() {
                    return Err(RuntimeError::InvalidGraph(format!(
                        "{} is read but '{}' produces a single value",
                        extra, node.op
                    )));
                }
            }

            let metas = graph.input_metas(&node)?;
            let meta = kind.infer(&metas, &node.attrs).with_context(|| {
                metas
                    .iter()
                    .fold(ErrorContext::new(&format!("{} '{}'", node.id, node.op)), |ctx, m| {
                        ctx.with_shape(&m.to_string())
                    })
                    .with_device(&graph.device().id().to_string())
            })?;

            let edge = graph.edge_mut(first)?;
            if edge.meta != meta {
                edge.meta = meta;
                edge.tensor = None;
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
    use crate::device::{Device, KernelAttributes};
    use crate::graph::GraphBuilder;
    use crate::tensor::DType;
    use std::sync::Arc;

    #[test]
    fn test_reduction_shape_propagates() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let x = builder.input(&[2, 3], DType::F32).unwrap();
        let row = builder.input(&[3], DType::F32).unwrap();
        let s = builder
            .op("sum", &[x], KernelAttributes::new().with_int("axis", 0))
            .unwrap();
        let y = builder.op("add", &[s, row], KernelAttributes::new()).unwrap();
        builder.mark_output(y).unwrap();
        let mut graph = builder.build();

        let result = ShapeInferencePass.run(&mut graph).unwrap();
        assert!(result.changed);
        let reduced = graph.edge(s).unwrap();
        assert_eq!(reduced.meta.shape, vec![3]);
        assert!(reduced.tensor.is_none());
        assert_eq!(graph.edge(y).unwrap().meta.shape, vec![3]);

        assert!(!ShapeInferencePass.run(&mut graph).unwrap().changed);
    }

    #[test]
    fn test_used_extra_output_is_rejected() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let a = builder.input(&[2], DType::F32).unwrap();
        let b = builder.input(&[2], DType::F32).unwrap();
        let outs = builder.op_outputs("add", &[a, b], KernelAttributes::new()).unwrap();
        builder.mark_output(outs[1]).unwrap();
        let mut graph = builder.build();
        assert!(matches!(
            ShapeInferencePass.run(&mut graph),
            Err(RuntimeError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_custom_ops_are_opaque() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let a = builder.input(&[4], DType::I8).unwrap();
        let b = builder.input(&[7], DType::F64).unwrap();
        let outs = builder.op_outputs("my_kernel", &[a, b], KernelAttributes::new()).unwrap();
        builder.mark_output(outs[1]).unwrap();
        let mut graph = builder.build();
        assert!(!ShapeInferencePass.run(&mut graph).unwrap().changed);
        assert_eq!(graph.edge(outs[1]).unwrap().meta.shape, vec![7]);
    }

    #[test]
    fn test_incompatible_shapes_fail() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let a = builder.input(&[2], DType::F32).unwrap();
        let b = builder.input(&[3], DType::F32).unwrap();
        let y = builder.op("mul", &[a, b], KernelAttributes::new()).unwrap();
        builder.mark_output(y).unwrap();
        let mut graph = builder.build();
        match ShapeInferencePass.run(&mut graph) {
            Err(RuntimeError::ShapeMismatch(message)) => {
                assert!(message.contains("'mul'"));
                assert!(message.contains("shapes: float32[2], float32[3]"));
                assert!(message.contains("device: cpu:0"));
            }
            other => panic!("expected a shape mismatch, got {:?}", other.map(|r| r.changed)),
        }
    }
}
