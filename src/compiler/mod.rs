//! Graph compilation: generic optimization, backend optimization, code
//! generation, in that order and nothing else.

pub mod model;

pub use model::Model;

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::device::{Device, DeviceId};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::Graph;
use crate::ops::OpKind;
use crate::optimizer::GraphOptimizer;
use crate::tensor::Tensor;

/// A compiled, backend-specific program bound to one graph's tensors.
///
/// Plans may be executed any number of times. They are not re-entrant:
/// `execute` takes `&mut self`.
pub trait ExecutionPlan: Send {
    fn execute(&mut self) -> RuntimeResult<()>;

    /// Tensors bound to the graph inputs, in declaration order
    fn inputs(&self) -> &[Tensor];

    /// Tensors bound to the graph outputs, in declaration order
    fn outputs(&self) -> &[Tensor];

    fn device_id(&self) -> DeviceId;

    fn num_steps(&self) -> usize;

    /// Copy `value` into input `index`
    fn bind_input(&mut self, index: usize, value: &Tensor) -> RuntimeResult<()> {
        let count = self.inputs().len();
        let mut slot = self
            .inputs()
            .get(index)
            .map(Tensor::shallow_clone)
            .ok_or_else(|| RuntimeError::OutOfRange(format!("input {} of a plan with {} inputs", index, count)))?;
        if slot.shape() != value.shape() {
            return Err(RuntimeError::shape_mismatch(
                &crate::tensor::shape_to_string(slot.shape()),
                &crate::tensor::shape_to_string(value.shape()),
                Some(&format!("binding plan input {}", index)),
            ));
        }
        slot.copy_(value)
    }
}

/// Lowers an optimized graph for one device
pub trait CodeGenerator: Send + Sync {
    fn device(&self) -> &Arc<Device>;

    /// Fail with `UnsupportedOperation` if some node has no kernel on the device
    fn check_supported(&self, graph: &Graph) -> RuntimeResult<()> {
        for node in graph.nodes() {
            let name = OpKind::lookup(&node.op).map(|k| k.name()).unwrap_or(node.op.as_str());
            if !self.device().has_kernel(name) {
                return Err(RuntimeError::UnsupportedOperation(format!(
                    "{} '{}' has no kernel on {}",
                    node.id,
                    node.op,
                    self.device().id()
                )));
            }
        }
        Ok(())
    }

    fn generate(&self, graph: &Graph) -> RuntimeResult<Box<dyn ExecutionPlan>>;
}

/// A fixed (generic optimizer, backend optimizer, code generator) triple
pub struct Compiler {
    generic: Box<dyn GraphOptimizer>,
    backend: Box<dyn GraphOptimizer>,
    codegen: Box<dyn CodeGenerator>,
}

impl Compiler {
    pub fn new(
        generic: Box<dyn GraphOptimizer>,
        backend: Box<dyn GraphOptimizer>,
        codegen: Box<dyn CodeGenerator>,
    ) -> Self {
        Self {
            generic,
            backend,
            codegen,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        self.codegen.device()
    }

    /// Optimize `graph` in place and lower it to a plan.
    ///
    /// Every structural check runs before the first optimizer pass, so an
    /// unsupported graph fails without allocating anything.
    pub fn compile(&self, graph: &mut Graph) -> RuntimeResult<Box<dyn ExecutionPlan>> {
        let start = Instant::now();
        if graph.outputs().is_empty() {
            return Err(RuntimeError::InvalidGraph("graph declares no outputs".to_string()));
        }
        let target = self.codegen.device().id();
        if graph.device().id() != target {
            return Err(RuntimeError::device_mismatch(target, graph.device().id()));
        }
        graph.topo_order()?;
        self.codegen.check_supported(graph)?;
        // Slots from an earlier compile describe an earlier schedule.
        graph.set_memory_plan(None);

        let nodes_before = graph.num_nodes();
        let generic = self.generic.optimize(graph)?;
        let backend = self.backend.optimize(graph)?;
        let plan = self.codegen.generate(graph)?;

        info!(
            device = %target,
            generic = self.generic.name(),
            backend = self.backend.name(),
            nodes_before,
            nodes_after = graph.num_nodes(),
            rewrites = generic.rewrites_applied + backend.rewrites_applied,
            steps = plan.num_steps(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "graph compiled"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::cpu_compiler;
    use crate::config::{OptimizationLevel, OptimizerConfig};
    use crate::device::KernelAttributes;
    use crate::graph::GraphBuilder;
    use crate::optimizer::test_support::kernel_device;
    use crate::tensor::DType;

    fn compiler_for(device: &Arc<Device>, level: OptimizationLevel) -> Compiler {
        let config = OptimizerConfig {
            level,
            ..OptimizerConfig::default()
        };
        cpu_compiler(Arc::clone(device), &config)
    }

    #[test]
    fn test_compile_and_execute_repeatedly() {
        let device = kernel_device();
        let mut builder = GraphBuilder::new(device.clone());
        let x = builder.input(&[2, 3], DType::F32).unwrap();
        let bias = builder
            .constant(Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3], &device).unwrap())
            .unwrap();
        let y = builder.op("add", &[x, bias], KernelAttributes::new()).unwrap();
        let r = builder.op("relu", &[y], KernelAttributes::new()).unwrap();
        let s = builder
            .op("sum", &[r], KernelAttributes::new().with_int("axis", -1))
            .unwrap();
        builder.mark_output(s).unwrap();
        let mut graph = builder.build();

        let mut plan = compiler_for(&device, OptimizationLevel::Aggressive)
            .compile(&mut graph)
            .unwrap();
        assert_eq!(plan.outputs()[0].shape(), &[2]);

        let input = Tensor::from_slice(&[-5.0f32, 0.0, 1.0, 1.0, 1.0, -10.0], &[2, 3], &device).unwrap();
        plan.bind_input(0, &input).unwrap();
        plan.execute().unwrap();
        assert_eq!(plan.outputs()[0].to_vec::<f32>().unwrap(), vec![6.0, 5.0]);

        let input = Tensor::full(&[2, 3], DType::F32, 1.0, &device).unwrap();
        plan.bind_input(0, &input).unwrap();
        plan.execute().unwrap();
        assert_eq!(plan.outputs()[0].to_vec::<f32>().unwrap(), vec![9.0, 9.0]);
        assert!(plan.bind_input(1, &input).is_err());
    }

    #[test]
    fn test_every_level_computes_the_same_bits() {
        let device = kernel_device();
        let data: Vec<f32> = (0..64).map(|i| (i as f32 * 0.731).sin() * 3.0).collect();
        let mut results = Vec::new();
        for level in [OptimizationLevel::None, OptimizationLevel::Basic, OptimizationLevel::Aggressive] {
            let mut builder = GraphBuilder::new(device.clone());
            let x = builder.input(&[8, 8], DType::F32).unwrap();
            let w = builder.input(&[8, 8], DType::F32).unwrap();
            let a = builder.op("mul", &[x, w], KernelAttributes::new()).unwrap();
            let b = builder
                .op("add_scalar", &[a], KernelAttributes::new().with_float("scalar", 0.1))
                .unwrap();
            let c = builder.op("exp", &[b], KernelAttributes::new()).unwrap();
            let d = builder.op("sub", &[c, x], KernelAttributes::new()).unwrap();
            let e = builder.op("mean", &[d], KernelAttributes::new()).unwrap();
            builder.mark_output(d).unwrap();
            builder.mark_output(e).unwrap();
            let mut graph = builder.build();

            let mut plan = compiler_for(&device, level).compile(&mut graph).unwrap();
            let xs = Tensor::from_slice(&data, &[8, 8], &device).unwrap();
            let ws = Tensor::from_slice(&data.iter().rev().copied().collect::<Vec<_>>(), &[8, 8], &device).unwrap();
            plan.bind_input(0, &xs).unwrap();
            plan.bind_input(1, &ws).unwrap();
            plan.execute().unwrap();
            let bits: Vec<Vec<u32>> = plan
                .outputs()
                .iter()
                .map(|t| t.to_vec::<f32>().unwrap().iter().map(|v| v.to_bits()).collect())
                .collect();
            if level == OptimizationLevel::Aggressive {
                assert!(graph.nodes().any(|n| n.op == crate::ops::schema::FUSED_ELEMENTWISE));
            }
            results.push(bits);
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn test_structural_failures_happen_before_allocation() {
        let device = kernel_device();
        let compiler = compiler_for(&device, OptimizationLevel::Aggressive);

        let mut empty = GraphBuilder::new(device.clone()).build();
        assert!(matches!(compiler.compile(&mut empty), Err(RuntimeError::InvalidGraph(_))));

        let mut builder = GraphBuilder::new(device.clone());
        let x = builder.input(&[1024], DType::F64).unwrap();
        let y = builder.op("conv2d", &[x], KernelAttributes::new()).unwrap();
        builder.mark_output(y).unwrap();
        let mut graph = builder.build();
        let before = device.memory_stats().allocations;
        assert!(matches!(
            compiler.compile(&mut graph),
            Err(RuntimeError::UnsupportedOperation(_))
        ));
        assert_eq!(device.memory_stats().allocations, before);

        let other = Arc::new(Device::cpu(7));
        let mut builder = GraphBuilder::new(other);
        let x = builder.input(&[2], DType::F32).unwrap();
        builder.mark_output(x).unwrap();
        let mut graph = builder.build();
        assert!(matches!(
            compiler.compile(&mut graph),
            Err(RuntimeError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_custom_kernels_compile_when_registered() {
        let device = kernel_device();
        device.register_fn("double", |inputs, outputs, _| {
            let values: Vec<f32> = inputs[0].to_vec::<f32>()?.iter().map(|v| v * 2.0).collect();
            outputs[0].write_from_slice(&values)
        });
        let mut builder = GraphBuilder::new(device.clone());
        let x = builder.input(&[3], DType::F32).unwrap();
        let y = builder.op("double", &[x], KernelAttributes::new()).unwrap();
        let z = builder.op("neg", &[y], KernelAttributes::new()).unwrap();
        builder.mark_output(z).unwrap();
        let mut graph = builder.build();

        let mut plan = compiler_for(&device, OptimizationLevel::Aggressive)
            .compile(&mut graph)
            .unwrap();
        plan.bind_input(0, &Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3], &device).unwrap())
            .unwrap();
        plan.execute().unwrap();
        assert_eq!(plan.outputs()[0].to_vec::<f32>().unwrap(), vec![-2.0, -4.0, -6.0]);
    }
}
