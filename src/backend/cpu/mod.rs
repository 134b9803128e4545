//! The host CPU backend: builtin kernels, the CPU optimizer phase and a
//! code generator producing launch lists.

pub mod codegen;
pub mod kernels;
pub mod optimizer;

pub use codegen::{CpuCodeGenerator, CpuExecutionPlan};
pub use kernels::{register_builtin_kernels, BuiltinKernel, FusedElementwiseKernel};
pub use optimizer::CpuGraphOptimizer;

use std::sync::Arc;

use super::Backend;
use crate::compiler::Compiler;
use crate::config::{ExecutionConfig, MemoryConfig, OptimizerConfig, RuntimeConfig};
use crate::device::{CpuAllocator, Device, DeviceId, DeviceType};
use crate::error::{RuntimeError, RuntimeResult};
use crate::optimizer::GenericGraphOptimizer;

fn worker_threads(exec: &ExecutionConfig) -> usize {
    if exec.num_worker_threads > 0 {
        return exec.num_worker_threads;
    }
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads()
    }
    #[cfg(not(feature = "parallel"))]
    {
        1
    }
}

/// CPU device `index` with its own allocator and every builtin kernel
pub fn cpu_device(index: usize, memory: &MemoryConfig, exec: &ExecutionConfig) -> Device {
    let id = DeviceId::cpu(index);
    let device = Device::new(id, Arc::new(CpuAllocator::with_config(id, memory)))
        .with_description(format!("CPU device with {} threads", worker_threads(exec)));
    register_builtin_kernels(&device, exec);
    device
}

/// Generic phase, CPU phase and CPU code generation for `device`
pub fn cpu_compiler(device: Arc<Device>, config: &OptimizerConfig) -> Compiler {
    Compiler::new(
        Box::new(GenericGraphOptimizer::new(config)),
        Box::new(CpuGraphOptimizer::new(config)),
        Box::new(CpuCodeGenerator::new(device)),
    )
}

/// The CPU backend with `config.backend.cpu_devices` devices
pub fn cpu_backend(config: &RuntimeConfig) -> RuntimeResult<Backend> {
    if config.backend.cpu_devices == 0 {
        return Err(RuntimeError::ConfigurationError(
            "backend.cpu_devices must be at least 1".to_string(),
        ));
    }
    let optimizer = config.optimizer.clone();
    let mut backend = Backend::new("cpu", DeviceType::Cpu).with_compiler(move |device| {
        if device.device_type() != DeviceType::Cpu {
            return Err(RuntimeError::device_mismatch("cpu device", device.id()));
        }
        Ok(cpu_compiler(device, &optimizer))
    });
    for index in 0..config.backend.cpu_devices {
        let device = cpu_device(index, &config.memory, &config.execution);
        backend = backend.with_device(Arc::new(device))?;
    }
    Ok(backend)
}
