//! Host kernels registered on every CPU device

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ExecutionConfig;
use crate::device::kernel::expect_arity;
use crate::device::{Device, Kernel, KernelAttributes};
use crate::error::{RuntimeError, RuntimeResult};
use crate::ops::schema::{keepdim, reduce_axis, FUSED_ELEMENTWISE};
use crate::ops::{elementwise, reduce, FusedChain, OpKind};
use crate::tensor::Tensor;

/// One builtin op bound to the device's execution settings
pub struct BuiltinKernel {
    kind: OpKind,
    exec: ExecutionConfig,
}

impl BuiltinKernel {
    pub fn new(kind: OpKind, exec: &ExecutionConfig) -> Self {
        Self {
            kind,
            exec: exec.clone(),
        }
    }
}

impl Kernel for BuiltinKernel {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn launch(&self, inputs: &[Tensor], outputs: &mut [Tensor], attrs: &KernelAttributes) -> RuntimeResult<()> {
        expect_arity(self.kind.name(), inputs, outputs, self.kind.arity(), 1)?;
        let threshold = self.exec.parallel_threshold;
        let out = &mut outputs[0];
        match self.kind {
            OpKind::Binary(op) => elementwise::binary(op, &inputs[0], &inputs[1], out, threshold),
            OpKind::Unary(op) => elementwise::unary(op, &inputs[0], out, threshold),
            OpKind::Scalar(op) => elementwise::scalar(op, &inputs[0], attrs.require_float("scalar")?, out, threshold),
            OpKind::Reduce(op) => {
                let axis = reduce_axis(attrs, inputs[0].ndim())?;
                reduce::reduce(
                    op,
                    &inputs[0],
                    axis,
                    keepdim(attrs),
                    out,
                    threshold,
                    self.exec.reduction_chunk,
                )
            }
            OpKind::Identity => out.copy_(&inputs[0]),
        }
    }
}

/// Runs fusion-generated programs read from the string attr `program`.
///
/// Parsed programs are cached by their text, so repeated launches of a plan
/// do not re-parse.
pub struct FusedElementwiseKernel {
    exec: ExecutionConfig,
    programs: RwLock<HashMap<String, Arc<FusedChain>>>,
}

impl FusedElementwiseKernel {
    pub fn new(exec: &ExecutionConfig) -> Self {
        Self {
            exec: exec.clone(),
            programs: RwLock::new(HashMap::new()),
        }
    }

    fn program(&self, text: &str) -> RuntimeResult<Arc<FusedChain>> {
        if let Some(chain) = self.programs.read().get(text) {
            return Ok(Arc::clone(chain));
        }
        let chain = Arc::new(FusedChain::from_json(text)?);
        self.programs.write().insert(text.to_string(), Arc::clone(&chain));
        Ok(chain)
    }
}

impl Kernel for FusedElementwiseKernel {
    fn name(&self) -> &str {
        FUSED_ELEMENTWISE
    }

    fn launch(&self, inputs: &[Tensor], outputs: &mut [Tensor], attrs: &KernelAttributes) -> RuntimeResult<()> {
        let text = attrs
            .string("program")
            .ok_or_else(|| RuntimeError::InvalidInput("fused_elementwise needs a 'program' attribute".to_string()))?;
        let chain = self.program(text)?;
        expect_arity(FUSED_ELEMENTWISE, inputs, outputs, chain.num_inputs, 1)?;
        chain.execute(inputs, &mut outputs[0], self.exec.parallel_threshold)
    }
}

/// Register every builtin op plus the fused-program kernel on `device`
pub fn register_builtin_kernels(device: &Device, exec: &ExecutionConfig) {
    for kind in OpKind::all() {
        device.register_kernel(Arc::new(BuiltinKernel::new(kind, exec)));
    }
    device.register_kernel(Arc::new(FusedElementwiseKernel::new(exec)));
}
