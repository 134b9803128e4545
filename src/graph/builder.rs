use std::sync::Arc;

use super::{EdgeId, EdgeKind, Graph};
use crate::backend::Backend;
use crate::device::{Device, KernelAttributes};
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::{DType, Tensor};

/// Records operations into a [`Graph`] instead of executing them.
///
/// Every recorded op gets one output edge per input edge, allocated with
/// that input's shape and dtype; the optimizer later corrects the metadata
/// of builtin ops and drops the outputs they do not produce.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            graph: Graph::new(device),
        }
    }

    /// Build on device `index` of `backend`
    pub fn for_backend(backend: &Backend, index: usize) -> RuntimeResult<Self> {
        Ok(Self::new(backend.device(index)?))
    }

    pub fn device(&self) -> &Arc<Device> {
        self.graph.device()
    }

    /// A fresh input, allocated on the builder's device
    pub fn input(&mut self, shape: &[usize], dtype: DType) -> RuntimeResult<EdgeId> {
        let tensor = Tensor::zeros(shape, dtype, self.graph.device())?;
        Ok(self.graph.add_edge(EdgeKind::Input, tensor.meta(), Some(tensor)))
    }

    /// A compile-time-known value
    pub fn constant(&mut self, tensor: Tensor) -> RuntimeResult<EdgeId> {
        let device = self.graph.device().id();
        if tensor.device_id() != device {
            return Err(RuntimeError::device_mismatch(device, tensor.device_id()));
        }
        Ok(self.graph.add_edge(EdgeKind::Constant, tensor.meta(), Some(tensor)))
    }

    /// Record `name(inputs)` and return its first output
    pub fn op(&mut self, name: &str, inputs: &[EdgeId], attrs: KernelAttributes) -> RuntimeResult<EdgeId> {
        let outputs = self.op_outputs(name, inputs, attrs)?;
        Ok(outputs[0])
    }

    /// Record `name(inputs)` and return all of its outputs
    pub fn op_outputs(&mut self, name: &str, inputs: &[EdgeId], attrs: KernelAttributes) -> RuntimeResult<Vec<EdgeId>> {
        if inputs.is_empty() {
            return Err(RuntimeError::InvalidInput(format!("op '{}' needs at least one input", name)));
        }
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let meta = self.graph.edge(*input)?.meta.clone();
            let tensor = Tensor::zeros(&meta.shape, meta.dtype, self.graph.device())?;
            outputs.push(self.graph.add_edge(EdgeKind::Intermediate, meta, Some(tensor)));
        }
        self.graph.add_node(name, inputs, &outputs, attrs)?;
        Ok(outputs)
    }

    pub fn mark_output(&mut self, edge: EdgeId) -> RuntimeResult<()> {
        self.graph.mark_output(edge)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
