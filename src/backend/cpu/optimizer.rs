use crate::config::OptimizerConfig;
use crate::error::RuntimeResult;
use crate::graph::Graph;
use crate::optimizer::{ElementwiseFusionPass, GraphOptimizer, MemoryPlanningPass, PassPipeline, PassResult};

/// CPU backend phase: elementwise fusion, then memory planning
pub struct CpuGraphOptimizer {
    pipeline: PassPipeline,
}

impl CpuGraphOptimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        let mut pipeline = PassPipeline::new("cpu");
        if config.backend_enabled(config.kernel_fusion) {
            pipeline = pipeline.add_pass(Box::new(ElementwiseFusionPass::new(config.max_fusion_depth)));
        }
        if config.backend_enabled(config.memory_planning) {
            pipeline = pipeline.add_pass(Box::new(MemoryPlanningPass));
        }
        Self { pipeline }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.pipeline.pass_names()
    }
}

impl GraphOptimizer for CpuGraphOptimizer {
    fn name(&self) -> &str {
        "cpu"
    }

    fn optimize(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        self.pipeline.run(graph)
    }
}
