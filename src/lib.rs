//! Anvil runtime - the tensor execution core of the Anvil framework
//!
//! Features:
//! - Strided tensors with zero-copy views over reference-counted device buffers
//! - Devices that own their allocator and a registry of named kernels
//! - Backends and a backend manager resolving devices by type and index
//! - Deferred computation graphs recorded through `GraphBuilder`
//! - A compiler pipeline: generic optimization, backend optimization
//!   (elementwise fusion, memory planning) and code generation
//! - A host CPU backend with rayon-parallel, bit-reproducible kernels

pub mod backend;
pub mod compiler;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod ops;
pub mod optimizer;
pub mod tensor;

pub use backend::{Backend, BackendManager};
pub use compiler::{CodeGenerator, Compiler, ExecutionPlan, Model};
pub use config::{ConfigBuilder, OptimizationLevel, RuntimeConfig};
pub use device::{Allocator, CpuAllocator, Device, DeviceId, DeviceType, Kernel, KernelAttributes};
pub use error::{RuntimeError, RuntimeResult};
pub use graph::{EdgeId, EdgeKind, Graph, GraphBuilder, NodeId};
pub use optimizer::{GenericGraphOptimizer, GraphOptimizer, PassResult};
pub use tensor::{Buffer, DType, Element, Tensor, TensorMeta};

use tracing::Level;

/// Install the log subscriber and size the kernel thread pool from the
/// global configuration. Calling it again is harmless.
pub fn init() -> RuntimeResult<()> {
    let config = config::get_config();
    config.validate()?;

    let level = if config.development.verbose_logging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(e) = tracing_subscriber::fmt().with_max_level(level).try_init() {
        tracing::debug!("keeping the installed log subscriber: {}", e);
    }

    #[cfg(feature = "parallel")]
    if config.execution.num_worker_threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(config.execution.num_worker_threads)
            .build_global()
        {
            tracing::warn!("worker pool already configured: {}", e);
        }
    }

    tracing::info!(version = version(), "Anvil runtime initialized");
    Ok(())
}

/// Get the current runtime version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
