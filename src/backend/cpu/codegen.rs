use std::collections::HashMap;
use std::sync::Arc;

use crate::compiler::{CodeGenerator, ExecutionPlan};
use crate::device::{Device, DeviceId, Kernel, KernelAttributes};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Edge, EdgeId, EdgeKind, Graph};
use crate::ops::OpKind;
use crate::tensor::{compute_strides, Buffer, Tensor};

/// Lowers a graph to a list of resolved kernel launches on one CPU device
pub struct CpuCodeGenerator {
    device: Arc<Device>,
}

impl CpuCodeGenerator {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    fn resolve(&self, op: &str) -> RuntimeResult<Arc<dyn Kernel>> {
        let name = OpKind::lookup(op).map(|k| k.name()).unwrap_or(op);
        self.device.kernel(name).map_err(|_| {
            RuntimeError::UnsupportedOperation(format!("'{}' has no kernel on {}", op, self.device.id()))
        })
    }

    fn materialize(&self, edge: &Edge, slot: Option<&Arc<Buffer>>) -> RuntimeResult<Tensor> {
        let meta = &edge.meta;
        if let Some(buffer) = slot {
            return Tensor::from_buffer(
                Arc::clone(buffer),
                &meta.shape,
                &compute_strides(&meta.shape),
                0,
                &self.device,
            );
        }
        match &edge.tensor {
            Some(t) if t.meta() == *meta => {
                if t.device_id() != self.device.id() {
                    return Err(RuntimeError::device_mismatch(self.device.id(), t.device_id()));
                }
                Ok(t.shallow_clone())
            }
            _ if edge.kind == EdgeKind::Intermediate => Tensor::zeros(&meta.shape, meta.dtype, &self.device),
            _ => Err(RuntimeError::InvalidGraph(format!(
                "{} edge {} has no tensor of type {}",
                if edge.kind == EdgeKind::Input { "input" } else { "constant" },
                edge.id,
                meta
            ))),
        }
    }
}

impl CodeGenerator for CpuCodeGenerator {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn generate(&self, graph: &Graph) -> RuntimeResult<Box<dyn ExecutionPlan>> {
        let order = graph.topo_order()?;
        let mut kernels = Vec::with_capacity(order.len());
        for id in &order {
            kernels.push(self.resolve(&graph.node(*id)?.op)?);
        }

        let slots: Vec<Arc<Buffer>> = match graph.memory_plan() {
            Some(plan) => plan
                .slots
                .iter()
                .map(|(dtype, numel)| self.device.alloc(*numel, *dtype))
                .collect::<RuntimeResult<_>>()?,
            None => Vec::new(),
        };
        let mut tensors: HashMap<EdgeId, Tensor> = HashMap::new();
        for edge in graph.edges() {
            let slot = graph
                .memory_plan()
                .and_then(|plan| plan.slot_of(edge.id))
                .and_then(|s| slots.get(s));
            tensors.insert(edge.id, self.materialize(edge, slot)?);
        }
        let lookup = |e: &EdgeId| {
            tensors
                .get(e)
                .map(Tensor::shallow_clone)
                .ok_or_else(|| RuntimeError::InternalError(format!("edge {} was not materialized", e)))
        };

        let mut steps = Vec::with_capacity(order.len());
        for (id, kernel) in order.iter().zip(kernels) {
            let node = graph.node(*id)?;
            steps.push(PlanStep {
                kernel,
                inputs: node.inputs.iter().map(lookup).collect::<RuntimeResult<_>>()?,
                outputs: node.outputs.iter().map(lookup).collect::<RuntimeResult<_>>()?,
                attrs: node.attrs.clone(),
            });
        }

        Ok(Box::new(CpuExecutionPlan {
            device: Arc::clone(&self.device),
            steps,
            inputs: graph.inputs().iter().map(lookup).collect::<RuntimeResult<_>>()?,
            outputs: graph.outputs().iter().map(lookup).collect::<RuntimeResult<_>>()?,
            slot_bytes: slots.iter().map(|b| b.nbytes()).sum(),
        }))
    }
}

struct PlanStep {
    kernel: Arc<dyn Kernel>,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    attrs: KernelAttributes,
}

/// Kernel launches in schedule order over tensors bound at compile time
pub struct CpuExecutionPlan {
    device: Arc<Device>,
    steps: Vec<PlanStep>,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    slot_bytes: usize,
}

impl CpuExecutionPlan {
    /// Bytes of shared intermediate storage owned by the plan
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }
}

impl ExecutionPlan for CpuExecutionPlan {
    fn execute(&mut self) -> RuntimeResult<()> {
        for step in &mut self.steps {
            self.device
                .launch(step.kernel.as_ref(), &step.inputs, &mut step.outputs, &step.attrs)?;
        }
        Ok(())
    }

    fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    fn num_steps(&self) -> usize {
        self.steps.len()
    }
}
