use super::{Compiler, ExecutionPlan};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::Graph;
use crate::tensor::Tensor;

/// A graph together with the plan compiled from it.
///
/// Any mutable access to the graph drops the plan; the model has to be
/// compiled again before it can run.
pub struct Model {
    graph: Graph,
    plan: Option<Box<dyn ExecutionPlan>>,
}

impl Model {
    pub fn new(graph: Graph) -> Self {
        Self { graph, plan: None }
    }

    pub fn compile(&mut self, compiler: &Compiler) -> RuntimeResult<()> {
        self.plan = None;
        self.plan = Some(compiler.compile(&mut self.graph)?);
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    fn plan_mut(&mut self) -> RuntimeResult<&mut Box<dyn ExecutionPlan>> {
        self.plan
            .as_mut()
            .ok_or_else(|| RuntimeError::InvalidState("model has not been compiled".to_string()))
    }

    pub fn set_input(&mut self, index: usize, value: &Tensor) -> RuntimeResult<()> {
        self.plan_mut()?.bind_input(index, value)
    }

    pub fn run(&mut self) -> RuntimeResult<()> {
        self.plan_mut()?.execute()
    }

    /// Bind every input in order, run, and return the outputs
    pub fn forward(&mut self, inputs: &[Tensor]) -> RuntimeResult<Vec<Tensor>> {
        for (i, input) in inputs.iter().enumerate() {
            self.set_input(i, input)?;
        }
        self.run()?;
        self.outputs()
    }

    /// Views of the output tensors; the next run overwrites them
    pub fn outputs(&self) -> RuntimeResult<Vec<Tensor>> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidState("model has not been compiled".to_string()))?;
        Ok(plan.outputs().iter().map(Tensor::shallow_clone).collect())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        self.plan = None;
        self.graph.set_memory_plan(None);
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }
}
