//! Device identity, allocation and kernel dispatch
//!
//! A [`Device`] is the only component that allocates memory or runs kernels.
//! Each device owns one [`Allocator`] and a registry of named [`Kernel`]s.

pub mod allocator;
pub mod kernel;

pub use allocator::{Allocator, AllocatorStats, CpuAllocator};
pub use kernel::{FnKernel, Kernel, KernelAttributes};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorContext, RuntimeError, RuntimeResult, WithContext};
use crate::tensor::{Buffer, DType, Tensor};

/// Device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Rocm,
}

impl DeviceType {
    pub const fn prefix(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Rocm => "rocm",
        }
    }

    /// Get optimal memory alignment for this device family
    pub const fn memory_alignment(&self) -> usize {
        match self {
            DeviceType::Cpu => 64,
            DeviceType::Cuda | DeviceType::Rocm => 256,
        }
    }
}

/// Structural device identity: family plus ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub device_type: DeviceType,
    pub index: usize,
}

impl DeviceId {
    pub const fn new(device_type: DeviceType, index: usize) -> Self {
        Self { device_type, index }
    }

    pub const fn cpu(index: usize) -> Self {
        Self::new(DeviceType::Cpu, index)
    }

    pub const fn cuda(index: usize) -> Self {
        Self::new(DeviceType::Cuda, index)
    }

    pub const fn rocm(index: usize) -> Self {
        Self::new(DeviceType::Rocm, index)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type.prefix(), self.index)
    }
}

pub struct Device {
    id: DeviceId,
    allocator: Arc<dyn Allocator>,
    kernels: RwLock<HashMap<String, Arc<dyn Kernel>>>,
    description: String,
}

impl Device {
    /// The allocator is not checked against `id` here; `alloc` rejects a
    /// mismatched allocator before it is ever invoked.
    pub fn new(id: DeviceId, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            id,
            allocator,
            kernels: RwLock::new(HashMap::new()),
            description: format!("{} device", id.device_type.prefix().to_uppercase()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// A CPU device backed by a default [`CpuAllocator`]
    pub fn cpu(index: usize) -> Self {
        let id = DeviceId::cpu(index);
        Self::new(id, Arc::new(CpuAllocator::new(id)))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.id.device_type
    }

    pub fn name(&self) -> String {
        self.id.to_string()
    }

    pub fn properties(&self) -> &str {
        &self.description
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn memory_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Allocate a buffer for `count` elements of `dtype`
    pub fn alloc(&self, count: usize, dtype: DType) -> RuntimeResult<Arc<Buffer>> {
        let owner = self.allocator.device();
        if owner != self.id {
            return Err(RuntimeError::device_mismatch(self.id, owner));
        }
        let nbytes = count.checked_mul(dtype.size()).ok_or_else(|| {
            RuntimeError::InvalidShape(format!("{} elements of {} overflow the address space", count, dtype))
        })?;
        let ptr = self.allocator.allocate(nbytes)?;
        Ok(Arc::new(Buffer::new(ptr, nbytes, dtype, Arc::clone(&self.allocator))))
    }

    pub fn register_kernel(&self, kernel: Arc<dyn Kernel>) {
        let name = kernel.name().to_string();
        if self.kernels.write().insert(name.clone(), kernel).is_some() {
            tracing::debug!(device = %self.id, kernel = %name, "kernel replaced");
        }
    }

    pub fn register_fn<F>(&self, name: &str, func: F)
    where
        F: Fn(&[Tensor], &mut [Tensor], &KernelAttributes) -> RuntimeResult<()> + Send + Sync + 'static,
    {
        self.register_kernel(Arc::new(FnKernel::new(name, func)));
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        self.kernels.read().contains_key(name)
    }

    pub fn kernel(&self, name: &str) -> RuntimeResult<Arc<dyn Kernel>> {
        self.kernels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::unknown_kernel(name, self.id))
    }

    pub fn kernel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kernels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `name` in the registry and run it
    pub fn run_kernel(
        &self,
        name: &str,
        inputs: &[Tensor],
        outputs: &mut [Tensor],
        attrs: &KernelAttributes,
    ) -> RuntimeResult<()> {
        let kernel = self.kernel(name)?;
        self.launch(kernel.as_ref(), inputs, outputs, attrs)
    }

    /// Run an already-resolved kernel after checking tensor placement
    pub fn launch(
        &self,
        kernel: &dyn Kernel,
        inputs: &[Tensor],
        outputs: &mut [Tensor],
        attrs: &KernelAttributes,
    ) -> RuntimeResult<()> {
        for tensor in inputs.iter().chain(outputs.iter()) {
            if tensor.device_id() != self.id {
                return Err(RuntimeError::device_mismatch(self.id, tensor.device_id()));
            }
        }
        tracing::trace!(device = %self.id, kernel = kernel.name(), "launch");
        kernel.launch(inputs, outputs, attrs).with_context(|| {
            inputs
                .iter()
                .fold(ErrorContext::new(kernel.name()), |ctx, t| ctx.with_shape(&t.meta().to_string()))
                .with_device(&self.id.to_string())
        })
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id.to_string())
            .field("kernels", &self.kernels.read().len())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::cpu(0).to_string(), "cpu:0");
        assert_eq!(DeviceId::cuda(1).to_string(), "cuda:1");
        assert_eq!(DeviceId::rocm(0).to_string(), "rocm:0");
        assert_eq!(DeviceId::cpu(2), DeviceId::new(DeviceType::Cpu, 2));
        assert_eq!(DeviceType::Cuda.memory_alignment(), 256);
    }

    #[test]
    fn test_alloc_rejects_mismatched_allocator() {
        let allocator = Arc::new(CpuAllocator::new(DeviceId::cpu(0)));
        let device = Device::new(DeviceId::cuda(0), allocator.clone());
        let err = device.alloc(16, DType::F32).unwrap_err();
        assert!(matches!(err, RuntimeError::DeviceMismatch { .. }));
        assert_eq!(allocator.stats().allocations, 0);
    }

    #[test]
    fn test_alloc_size() {
        let device = Device::cpu(0);
        let buffer = device.alloc(10, DType::F64).unwrap();
        assert_eq!(buffer.nbytes(), 80);
        assert_eq!(buffer.dtype(), DType::F64);
        assert_eq!(buffer.device(), DeviceId::cpu(0));
        assert_eq!(device.memory_stats().bytes_in_use, 80);
        drop(buffer);
        assert_eq!(device.memory_stats().bytes_in_use, 0);
    }

    #[test]
    fn test_unknown_kernel_leaves_outputs_untouched() {
        let device = Arc::new(Device::cpu(0));
        let input = Tensor::full(&[4], DType::F32, 1.0, &device).unwrap();
        let mut outputs = [Tensor::full(&[4], DType::F32, 7.0, &device).unwrap()];
        let err = device
            .run_kernel("does_not_exist", &[input], &mut outputs, &KernelAttributes::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownKernel { .. }));
        assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![7.0; 4]);
    }

    #[test]
    fn test_run_kernel_rejects_foreign_tensor() {
        let here = Arc::new(Device::cpu(0));
        let there = Arc::new(Device::cpu(1));
        here.register_fn("noop", |_, _, _| Ok(()));
        let foreign = Tensor::zeros(&[2], DType::F32, &there).unwrap();
        let err = here
            .run_kernel("noop", &[foreign], &mut [], &KernelAttributes::new())
            .unwrap_err();
        assert_eq!(err, RuntimeError::device_mismatch(DeviceId::cpu(0), DeviceId::cpu(1)));
    }

    #[test]
    fn test_kernel_failures_name_the_launch() {
        let device = Arc::new(Device::cpu(0));
        device.register_fn("strict", |_, _, _| Err(RuntimeError::InvalidInput("bad operand".to_string())));
        let input = Tensor::zeros(&[2, 2], DType::F32, &device).unwrap();
        let mut outputs = [Tensor::zeros(&[2, 2], DType::F32, &device).unwrap()];
        match device.run_kernel("strict", &[input], &mut outputs, &KernelAttributes::new()) {
            Err(RuntimeError::InvalidInput(message)) => {
                assert!(message.starts_with("bad operand"));
                assert!(message.contains("operation: strict"));
                assert!(message.contains("shapes: float32[2, 2]"));
                assert!(message.contains("device: cpu:0"));
            }
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn test_registered_closure_runs() {
        let device = Arc::new(Device::cpu(0));
        device.register_fn("fill_seven", |_, outputs, _| {
            for out in outputs.iter_mut() {
                out.fill_(7.0)?;
            }
            Ok(())
        });
        assert!(device.has_kernel("fill_seven"));
        let mut outputs = [Tensor::zeros(&[3], DType::I32, &device).unwrap()];
        device
            .run_kernel("fill_seven", &[], &mut outputs, &KernelAttributes::new())
            .unwrap();
        assert_eq!(outputs[0].to_vec::<i32>().unwrap(), vec![7, 7, 7]);
    }
}
