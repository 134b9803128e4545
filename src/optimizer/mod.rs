//! Graph optimization passes and the two optimizer phases.
//!
//! The generic phase is device independent: shape/dtype inference,
//! canonicalization, constant folding and dead-code elimination. Backend
//! phases are supplied per backend (see `backend::cpu::CpuGraphOptimizer`)
//! and are built from the fusion and memory-planning passes here.
//!
//! Every phase must leave the shapes and dtypes of the declared outputs
//! unchanged and must be idempotent.

pub mod canonicalize;
pub mod constant_folding;
pub mod dce;
pub mod fusion;
pub mod memory_planning;
pub mod shape_inference;

pub use canonicalize::CanonicalizePass;
pub use constant_folding::ConstantFoldingPass;
pub use dce::DeadCodeEliminationPass;
pub use fusion::ElementwiseFusionPass;
pub use memory_planning::MemoryPlanningPass;
pub use shape_inference::ShapeInferencePass;

use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::Graph;

/// Statistics reported by a pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub changed: bool,
    pub rewrites_applied: usize,
    pub erased_nodes: usize,
    pub erased_edges: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
            erased_edges: self.erased_edges + other.erased_edges,
        }
    }
}

/// One rewrite over a whole graph
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult>;
}

/// An optimizer phase as seen by the compiler
pub trait GraphOptimizer: Send + Sync {
    fn name(&self) -> &str;
    fn optimize(&self, graph: &mut Graph) -> RuntimeResult<PassResult>;
}

/// Passes run in order; the output signature is checked after `guard_from`.
pub struct PassPipeline {
    name: String,
    passes: Vec<Box<dyn GraphPass>>,
    guard_from: usize,
}

impl PassPipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passes: Vec::new(),
            guard_from: 0,
        }
    }

    pub fn add_pass(mut self, pass: Box<dyn GraphPass>) -> Self {
        self.passes.push(pass);
        self
    }

    /// Passes added from now on must preserve the output signature
    pub fn guard_outputs(mut self) -> Self {
        self.guard_from = self.passes.len();
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let mut total = PassResult::default();
        let mut signature = None;
        for (i, pass) in self.passes.iter().enumerate() {
            if i == self.guard_from {
                signature = Some(graph.output_signature()?);
            }
            let result = pass.run(graph)?;
            debug!(
                phase = %self.name,
                pass = pass.name(),
                changed = result.changed,
                rewrites = result.rewrites_applied,
                erased_nodes = result.erased_nodes,
                erased_edges = result.erased_edges,
                "pass finished"
            );
            total = total.merge(result);
        }
        if let Some(before) = signature {
            let after = graph.output_signature()?;
            if before != after {
                return Err(RuntimeError::InternalError(format!(
                    "{} changed the graph outputs from {:?} to {:?}",
                    self.name, before, after
                )));
            }
        }
        Ok(total)
    }
}

/// Device-independent optimizer phase
pub struct GenericGraphOptimizer {
    pipeline: PassPipeline,
}

impl GenericGraphOptimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        let mut pipeline = PassPipeline::new("generic")
            .add_pass(Box::new(ShapeInferencePass))
            .guard_outputs();
        if config.generic_enabled(config.canonicalization) {
            pipeline = pipeline.add_pass(Box::new(CanonicalizePass));
        }
        if config.generic_enabled(config.constant_folding) {
            pipeline = pipeline.add_pass(Box::new(ConstantFoldingPass));
        }
        if config.generic_enabled(config.dead_code_elimination) {
            pipeline = pipeline.add_pass(Box::new(DeadCodeEliminationPass));
        }
        Self { pipeline }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.pipeline.pass_names()
    }
}

impl Default for GenericGraphOptimizer {
    fn default() -> Self {
        Self::new(&crate::config::get_config().optimizer)
    }
}

impl GraphOptimizer for GenericGraphOptimizer {
    fn name(&self) -> &str {
        "generic"
    }

    fn optimize(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        self.pipeline.run(graph)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::backend::cpu::cpu_device;
    use crate::config::{ExecutionConfig, MemoryConfig};
    use crate::device::Device;

    pub fn kernel_device() -> Arc<Device> {
        Arc::new(cpu_device(0, &MemoryConfig::default(), &ExecutionConfig::default()))
    }
}
