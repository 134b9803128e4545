//! Composite elementwise programs produced by operator fusion.
//!
//! A chain evaluates its steps per element, in the order they were recorded,
//! in the tensors' own element type. No step is reordered or reassociated,
//! so a fused chain produces exactly the bits the unfused nodes would.

use serde::{Deserialize, Serialize};

use super::elementwise::ElementwiseOp;
use super::map_indexed;
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::dtype::{with_element_type, Element};
use crate::tensor::shape::shape_to_string;
use crate::tensor::Tensor;

/// Where a step reads one argument from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Input(usize),
    Step(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedStep {
    pub op: ElementwiseOp,
    pub operands: Vec<Operand>,
}

/// The result of a chain is the value of its last step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedChain {
    pub num_inputs: usize,
    pub steps: Vec<FusedStep>,
}

impl FusedChain {
    /// A one-step chain reading inputs `0..arity` in order
    pub fn single(op: ElementwiseOp) -> Self {
        let operands = (0..op.arity()).map(Operand::Input).collect();
        Self {
            num_inputs: op.arity(),
            steps: vec![FusedStep { op, operands }],
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Feed the result of `producer` into `consumer` wherever the consumer
    /// reads input `via`.
    ///
    /// `producer_inputs` and `consumer_inputs` name the external values
    /// behind each chain's inputs; the returned list names the merged
    /// chain's inputs, with duplicates shared.
    pub fn compose<K: Copy + PartialEq>(
        producer: &FusedChain,
        producer_inputs: &[K],
        consumer: &FusedChain,
        consumer_inputs: &[K],
        via: K,
    ) -> RuntimeResult<(FusedChain, Vec<K>)> {
        if producer.is_empty() || producer_inputs.len() != producer.num_inputs {
            return Err(RuntimeError::InternalError("malformed producer chain".to_string()));
        }
        if consumer_inputs.len() != consumer.num_inputs {
            return Err(RuntimeError::InternalError("malformed consumer chain".to_string()));
        }

        let mut inputs: Vec<K> = Vec::new();
        let mut index_of = |key: K| match inputs.iter().position(|k| *k == key) {
            Some(i) => i,
            None => {
                inputs.push(key);
                inputs.len() - 1
            }
        };

        let mut steps = Vec::with_capacity(producer.len() + consumer.len());
        for step in &producer.steps {
            let operands = step
                .operands
                .iter()
                .map(|operand| match *operand {
                    Operand::Input(i) => Operand::Input(index_of(producer_inputs[i])),
                    Operand::Step(s) => Operand::Step(s),
                })
                .collect();
            steps.push(FusedStep { op: step.op, operands });
        }

        let shift = producer.len();
        for step in &consumer.steps {
            let operands = step
                .operands
                .iter()
                .map(|operand| match *operand {
                    Operand::Input(i) if consumer_inputs[i] == via => Operand::Step(shift - 1),
                    Operand::Input(i) => Operand::Input(index_of(consumer_inputs[i])),
                    Operand::Step(s) => Operand::Step(s + shift),
                })
                .collect();
            steps.push(FusedStep { op: step.op, operands });
        }

        Ok((
            FusedChain {
                num_inputs: inputs.len(),
                steps,
            },
            inputs,
        ))
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.steps.is_empty() {
            return Err(RuntimeError::InvalidInput("fused chain has no steps".to_string()));
        }
        for (s, step) in self.steps.iter().enumerate() {
            if step.operands.len() != step.op.arity() {
                return Err(RuntimeError::InvalidInput(format!(
                    "step {} has {} operands for arity {}",
                    s,
                    step.operands.len(),
                    step.op.arity()
                )));
            }
            for operand in &step.operands {
                let ok = match *operand {
                    Operand::Input(i) => i < self.num_inputs,
                    Operand::Step(p) => p < s,
                };
                if !ok {
                    return Err(RuntimeError::InvalidInput(format!(
                        "step {} reads {:?} which is not yet defined",
                        s, operand
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> RuntimeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        let chain: FusedChain = serde_json::from_str(text)?;
        chain.validate()?;
        Ok(chain)
    }

    fn eval_at<T: Element>(&self, inputs: &[Vec<T>], i: usize, scratch: &mut Vec<T>) -> RuntimeResult<T> {
        scratch.clear();
        let mut args = [T::zero(); 2];
        for step in &self.steps {
            for (slot, operand) in args.iter_mut().zip(&step.operands) {
                *slot = match *operand {
                    Operand::Input(k) => inputs[k][i],
                    Operand::Step(s) => scratch[s],
                };
            }
            let value = step.op.eval(&args[..step.operands.len()])?;
            scratch.push(value);
        }
        scratch
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::InternalError("empty fused chain".to_string()))
    }

    /// Run the chain over same-shaped inputs into `out`
    pub fn execute(&self, inputs: &[Tensor], out: &mut Tensor, threshold: usize) -> RuntimeResult<()> {
        if inputs.len() != self.num_inputs {
            return Err(RuntimeError::InvalidInput(format!(
                "fused chain expects {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        for input in inputs {
            if input.shape() != out.shape() {
                return Err(RuntimeError::shape_mismatch(
                    &shape_to_string(out.shape()),
                    &shape_to_string(input.shape()),
                    Some("fused inputs must match the output shape"),
                ));
            }
            if input.dtype() != out.dtype() {
                return Err(RuntimeError::unsupported_dtype(input.dtype(), "fused_elementwise"));
            }
        }
        with_element_type!(out.dtype(), "fused_elementwise", T => {
            let values = inputs
                .iter()
                .map(|t| t.to_vec::<T>())
                .collect::<RuntimeResult<Vec<_>>>()?;
            let n = out.numel();
            let result = map_indexed(n, threshold, |i| {
                let mut scratch = Vec::with_capacity(self.steps.len());
                self.eval_at(&values, i, &mut scratch)
            })?;
            out.write_from_slice(&result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ops::{BinaryOp, ScalarOp, UnaryOp};
    use crate::tensor::DType;
    use std::sync::Arc;

    #[test]
    fn test_compose_rewires_operands() {
        // t = a + b ; r = relu(t) * c
        let add = FusedChain::single(ElementwiseOp::Binary(BinaryOp::Add));
        let relu = FusedChain::single(ElementwiseOp::Unary(UnaryOp::Relu));
        let (first, inputs) = FusedChain::compose(&add, &["a", "b"], &relu, &["t"], "t").unwrap();
        assert_eq!(inputs, vec!["a", "b"]);
        let mul = FusedChain::single(ElementwiseOp::Binary(BinaryOp::Mul));
        let (chain, inputs) = FusedChain::compose(&first, &inputs, &mul, &["r", "c"], "r").unwrap();
        assert_eq!(inputs, vec!["a", "b", "c"]);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.steps[2].operands, vec![Operand::Step(1), Operand::Input(2)]);
        chain.validate().unwrap();
    }

    #[test]
    fn test_compose_shares_duplicate_inputs() {
        // t = x * 2 ; r = t + x
        let scale = FusedChain::single(ElementwiseOp::Scalar(ScalarOp::MulScalar, 2.0));
        let add = FusedChain::single(ElementwiseOp::Binary(BinaryOp::Add));
        let (chain, inputs) = FusedChain::compose(&scale, &[1], &add, &[9, 1], 9).unwrap();
        assert_eq!(inputs, vec![1]);
        assert_eq!(chain.num_inputs, 1);
        assert_eq!(chain.steps[1].operands, vec![Operand::Step(0), Operand::Input(0)]);
    }

    #[test]
    fn test_json_round_trip_validates() {
        let chain = FusedChain::single(ElementwiseOp::Unary(UnaryOp::Neg));
        let text = chain.to_json().unwrap();
        assert_eq!(FusedChain::from_json(&text).unwrap(), chain);

        let broken = FusedChain {
            num_inputs: 1,
            steps: vec![FusedStep {
                op: ElementwiseOp::Unary(UnaryOp::Neg),
                operands: vec![Operand::Step(0)],
            }],
        };
        assert!(FusedChain::from_json(&broken.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_execute_matches_stepwise() {
        let device = Arc::new(Device::cpu(0));
        let a = Tensor::from_slice(&[0.1f32, -0.7, 3.3, 1e-3], &[4], &device).unwrap();
        let b = Tensor::from_slice(&[0.2f32, 0.9, -1.1, 7.0], &[4], &device).unwrap();
        let add = FusedChain::single(ElementwiseOp::Binary(BinaryOp::Add));
        let exp = FusedChain::single(ElementwiseOp::Unary(UnaryOp::Exp));
        let (chain, _) = FusedChain::compose(&add, &[0, 1], &exp, &[2], 2).unwrap();

        let mut fused = Tensor::zeros(&[4], DType::F32, &device).unwrap();
        chain.execute(&[a.shallow_clone(), b.shallow_clone()], &mut fused, usize::MAX).unwrap();

        let x = a.to_vec::<f32>().unwrap();
        let y = b.to_vec::<f32>().unwrap();
        let expected: Vec<f32> = x.iter().zip(&y).map(|(p, q)| (p + q).exp()).collect();
        assert_eq!(fused.to_vec::<f32>().unwrap(), expected);
    }
}
