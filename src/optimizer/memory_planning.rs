use std::collections::{BTreeMap, HashMap};

use super::{GraphPass, PassResult};
use crate::error::RuntimeResult;
use crate::graph::{EdgeId, EdgeKind, Graph, MemoryPlan};
use crate::tensor::DType;

/// Assigns intermediate edges to shared buffer slots.
///
/// Live ranges are measured in positions of the topological schedule. An
/// edge is live from the node producing it to its last reader; slots free up
/// only before a node strictly after that, so a node never writes into a
/// slot one of its inputs still occupies. Graph outputs, inputs and
/// constants keep their own storage.
pub struct MemoryPlanningPass;

struct Interval {
    edge: EdgeId,
    dtype: DType,
    numel: usize,
    last_use: usize,
}

impl MemoryPlanningPass {
    pub fn plan(graph: &Graph) -> RuntimeResult<MemoryPlan> {
        let order = graph.topo_order()?;
        let position: HashMap<_, _> = order.iter().enumerate().map(|(t, id)| (*id, t)).collect();

        let mut by_def: BTreeMap<usize, Vec<Interval>> = BTreeMap::new();
        for edge in graph.edges() {
            if edge.kind != EdgeKind::Intermediate || graph.is_output(edge.id) {
                continue;
            }
            let Some(def) = edge.producer.and_then(|p| position.get(&p).copied()) else {
                continue;
            };
            let last_use = graph
                .consumers(edge.id)
                .iter()
                .filter_map(|c| position.get(c).copied())
                .max()
                .unwrap_or(def);
            by_def.entry(def).or_default().push(Interval {
                edge: edge.id,
                dtype: edge.meta.dtype,
                numel: edge.meta.numel()?,
                last_use,
            });
        }

        let mut plan = MemoryPlan::default();
        // (slot, release position) for slots currently held
        let mut held: Vec<(usize, usize)> = Vec::new();
        let mut free: Vec<usize> = Vec::new();
        for (t, intervals) in by_def {
            held.retain(|&(slot, last_use)| {
                if last_use < t {
                    free.push(slot);
                    false
                } else {
                    true
                }
            });

            for interval in intervals {
                plan.bytes_without_reuse += interval.numel * interval.dtype.size();
                let slot = Self::best_fit(&plan.slots, &free, interval.dtype, interval.numel);
                let slot = match slot {
                    Some(slot) => {
                        free.retain(|s| *s != slot);
                        let size = &mut plan.slots[slot].1;
                        *size = (*size).max(interval.numel);
                        slot
                    }
                    None => {
                        plan.slots.push((interval.dtype, interval.numel));
                        plan.slots.len() - 1
                    }
                };
                plan.assignments.insert(interval.edge, slot);
                held.push((slot, interval.last_use));
            }
        }
        plan.bytes_with_reuse = plan.slots.iter().map(|(dtype, n)| n * dtype.size()).sum();
        Ok(plan)
    }

    /// Smallest free slot of `dtype` that fits, else the largest one to grow
    fn best_fit(slots: &[(DType, usize)], free: &[usize], dtype: DType, numel: usize) -> Option<usize> {
        let candidates = free.iter().copied().filter(|s| slots[*s].0 == dtype);
        let fitting = candidates.clone().filter(|s| slots[*s].1 >= numel).min_by_key(|s| (slots[*s].1, *s));
        fitting.or_else(|| candidates.max_by_key(|s| (slots[*s].1, usize::MAX - *s)))
    }
}

impl GraphPass for MemoryPlanningPass {
    fn name(&self) -> &'static str {
        "memory-planning"
    }

    fn run(&self, graph: &mut Graph) -> RuntimeResult<PassResult> {
        let plan = Self::plan(graph)?;
        let changed = graph.memory_plan() != Some(&plan);
        let planned: Vec<EdgeId> = plan.assignments.keys().copied().collect();
        for edge in planned {
            graph.edge_mut(edge)?.tensor = None;
        }
        let rewrites = plan.assignments.len();
        tracing::debug!(
            slots = plan.slots.len(),
            bytes_without_reuse = plan.bytes_without_reuse,
            bytes_with_reuse = plan.bytes_with_reuse,
            "memory plan"
        );
        graph.set_memory_plan(Some(plan));
        Ok(PassResult {
            changed,
            rewrites_applied: if changed { rewrites } else { 0 },
            ..PassResult::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, KernelAttributes};
    use crate::graph::GraphBuilder;
    use std::sync::Arc;

    fn chain(ops: &[&str], dtype: DType) -> (Graph, Vec<EdgeId>) {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let mut e = builder.input(&[16], dtype).unwrap();
        let mut edges = Vec::new();
        for op in ops {
            e = builder.op(op, &[e], KernelAttributes::new()).unwrap();
            edges.push(e);
        }
        builder.mark_output(e).unwrap();
        (builder.build(), edges)
    }

    #[test]
    fn test_non_overlapping_edges_share_slots() {
        let (mut graph, edges) = chain(&["neg", "abs", "relu", "neg", "abs"], DType::F32);
        let result = MemoryPlanningPass.run(&mut graph).unwrap();
        assert!(result.changed);

        let plan = graph.memory_plan().unwrap().clone();
        assert_eq!(plan.slots, vec![(DType::F32, 16), (DType::F32, 16)]);
        assert_eq!(plan.slot_of(edges[0]), Some(0));
        assert_eq!(plan.slot_of(edges[1]), Some(1));
        assert_eq!(plan.slot_of(edges[2]), Some(0));
        assert_eq!(plan.slot_of(edges[3]), Some(1));
        assert_eq!(plan.slot_of(edges[4]), None);
        assert_eq!(plan.bytes_without_reuse, 4 * 16 * 4);
        assert_eq!(plan.bytes_with_reuse, 2 * 16 * 4);
        assert!(graph.edge(edges[0]).unwrap().tensor.is_none());
        assert!(graph.edge(edges[4]).unwrap().tensor.is_some());

        assert!(!MemoryPlanningPass.run(&mut graph).unwrap().changed);
    }

    #[test]
    fn test_inputs_of_a_node_are_not_reused_for_its_output() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let x = builder.input(&[4], DType::F32).unwrap();
        let a = builder.op("neg", &[x], KernelAttributes::new()).unwrap();
        let b = builder.op("abs", &[a], KernelAttributes::new()).unwrap();
        let outs = builder.op_outputs("add", &[a, b], KernelAttributes::new()).unwrap();
        let y = builder.op("exp", &[outs[0]], KernelAttributes::new()).unwrap();
        builder.mark_output(y).unwrap();
        let mut graph = builder.build();
        crate::optimizer::DeadCodeEliminationPass.run(&mut graph).unwrap();

        let plan = MemoryPlanningPass::plan(&graph).unwrap();
        let slot_a = plan.slot_of(a).unwrap();
        let slot_b = plan.slot_of(b).unwrap();
        let slot_sum = plan.slot_of(outs[0]).unwrap();
        assert_ne!(slot_a, slot_b);
        assert_ne!(slot_sum, slot_a);
        assert_ne!(slot_sum, slot_b);
    }

    #[test]
    fn test_dtypes_never_share() {
        let mut builder = GraphBuilder::new(Arc::new(Device::cpu(0)));
        let x = builder.input(&[4], DType::F32).unwrap();
        let i = builder.input(&[4], DType::I32).unwrap();
        let a = builder.op("neg", &[x], KernelAttributes::new()).unwrap();
        let b = builder.op("abs", &[a], KernelAttributes::new()).unwrap();
        let c = builder.op("neg", &[i], KernelAttributes::new()).unwrap();
        let d = builder.op("abs", &[c], KernelAttributes::new()).unwrap();
        builder.mark_output(b).unwrap();
        builder.mark_output(d).unwrap();
        let graph = builder.build();

        let plan = MemoryPlanningPass::plan(&graph).unwrap();
        assert_eq!(plan.slots.len(), 2);
        assert_ne!(plan.slot_of(a), plan.slot_of(c));
    }

    #[test]
    fn test_best_fit_prefers_smallest_and_grows() {
        let slots = vec![(DType::F32, 8), (DType::F32, 32), (DType::F64, 64), (DType::F32, 4)];
        let free = vec![0, 1, 2, 3];
        assert_eq!(MemoryPlanningPass::best_fit(&slots, &free, DType::F32, 6), Some(0));
        assert_eq!(MemoryPlanningPass::best_fit(&slots, &free, DType::F32, 100), Some(1));
        assert_eq!(MemoryPlanningPass::best_fit(&slots, &free, DType::I8, 1), None);
    }
}
