//! Reductions over all elements or along one axis.
//!
//! Floating-point sums are accumulated in fixed blocks of `chunk` elements,
//! each block left to right, and the block partials are then combined left
//! to right. The block boundaries depend only on `chunk`, never on the
//! number of threads, so sums are bit-reproducible.

use serde::{Deserialize, Serialize};

use super::map_indexed;
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::dtype::{with_element_type, Element};
use crate::tensor::shape::shape_to_string;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 4] = [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Max, ReduceOp::Min];

    pub const fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }
}

/// Output shape of reducing `shape` over `axis` (all axes when `None`)
pub fn reduced_shape(shape: &[usize], axis: Option<usize>, keepdim: bool) -> Vec<usize> {
    match (axis, keepdim) {
        (None, false) => Vec::new(),
        (None, true) => vec![1; shape.len()],
        (Some(a), true) => {
            let mut out = shape.to_vec();
            out[a] = 1;
            out
        }
        (Some(a), false) => {
            let mut out = shape.to_vec();
            out.remove(a);
            out
        }
    }
}

fn block_sum<T: Element>(lane: &dyn Fn(usize) -> T, len: usize, chunk: usize) -> T {
    let mut total = T::zero();
    let mut start = 0;
    while start < len {
        let end = (start + chunk).min(len);
        let mut partial = T::zero();
        for k in start..end {
            partial = partial.add(lane(k));
        }
        total = total.add(partial);
        start = end;
    }
    total
}

fn reduce_lane<T: Element>(op: ReduceOp, lane: &dyn Fn(usize) -> T, len: usize, chunk: usize) -> RuntimeResult<T> {
    if len == 0 && op != ReduceOp::Sum {
        return Err(RuntimeError::InvalidShape(format!(
            "{} over zero elements is undefined",
            op.name()
        )));
    }
    Ok(match op {
        ReduceOp::Sum => block_sum(lane, len, chunk),
        ReduceOp::Mean => {
            if T::DTYPE.is_float() {
                block_sum(lane, len, chunk)
                    .checked_div(T::from_f64(len as f64))
                    .unwrap_or_else(T::zero)
            } else {
                let total: f64 = (0..len).map(|k| lane(k).to_f64()).sum();
                T::from_f64(total / len as f64)
            }
        }
        ReduceOp::Max => (1..len).fold(lane(0), |acc, k| acc.maximum(lane(k))),
        ReduceOp::Min => (1..len).fold(lane(0), |acc, k| acc.minimum(lane(k))),
    })
}

/// Reduce `input` into `out`, whose shape must be `reduced_shape(..)`.
pub fn reduce(
    op: ReduceOp,
    input: &Tensor,
    axis: Option<usize>,
    keepdim: bool,
    out: &mut Tensor,
    threshold: usize,
    chunk: usize,
) -> RuntimeResult<()> {
    let shape = input.shape();
    if let Some(a) = axis {
        if a >= shape.len() {
            return Err(RuntimeError::OutOfRange(format!(
                "axis {} for a rank-{} tensor",
                a,
                shape.len()
            )));
        }
    }
    let expected = reduced_shape(shape, axis, keepdim);
    if out.shape() != expected.as_slice() {
        return Err(RuntimeError::shape_mismatch(
            &shape_to_string(&expected),
            &shape_to_string(out.shape()),
            Some(&format!("output of '{}' has the wrong shape", op.name())),
        ));
    }
    if out.dtype() != input.dtype() {
        return Err(RuntimeError::unsupported_dtype(input.dtype(), op.name()));
    }

    // Logical layout: outer x len x inner, reducing the middle dimension.
    let (outer, len, inner) = match axis {
        None => (1, input.numel(), 1),
        Some(a) => (
            shape[..a].iter().product::<usize>(),
            shape[a],
            shape[a + 1..].iter().product::<usize>(),
        ),
    };
    let chunk = chunk.max(1);

    with_element_type!(input.dtype(), op.name(), T => {
        let values = input.to_vec::<T>()?;
        let result = if outer * inner == 1 && len >= threshold && op == ReduceOp::Sum {
            // One large lane: blocks in parallel, combined in block order.
            let blocks = len.div_ceil(chunk);
            let partials = map_indexed(blocks, 2, |b| {
                let start = b * chunk;
                let end = (start + chunk).min(len);
                let lane = |k: usize| values[start + k];
                Ok(block_sum(&lane, end - start, chunk))
            })?;
            vec![partials.into_iter().fold(<T as Element>::zero(), |acc, p| acc.add(p))]
        } else {
            map_indexed(outer * inner, threshold.div_ceil(len.max(1)), |o| {
                let base = (o / inner) * len * inner + o % inner;
                let lane = |k: usize| values[base + k * inner];
                reduce_lane(op, &lane, len, chunk)
            })?
        };
        out.write_from_slice(&result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::tensor::DType;
    use std::sync::Arc;

    fn cpu() -> Arc<Device> {
        Arc::new(Device::cpu(0))
    }

    #[test]
    fn test_reduced_shape() {
        assert_eq!(reduced_shape(&[2, 3, 4], Some(1), false), vec![2, 4]);
        assert_eq!(reduced_shape(&[2, 3, 4], Some(1), true), vec![2, 1, 4]);
        assert_eq!(reduced_shape(&[2, 3], None, false), Vec::<usize>::new());
        assert_eq!(reduced_shape(&[2, 3], None, true), vec![1, 1]);
    }

    #[test]
    fn test_axis_reductions() {
        let device = cpu();
        let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let t = Tensor::from_slice(&data, &[2, 3], &device).unwrap();

        let mut rows = Tensor::zeros(&[2], DType::F32, &device).unwrap();
        reduce(ReduceOp::Sum, &t, Some(1), false, &mut rows, usize::MAX, 4).unwrap();
        assert_eq!(rows.to_vec::<f32>().unwrap(), vec![3.0, 12.0]);

        let mut cols = Tensor::zeros(&[1, 3], DType::F32, &device).unwrap();
        reduce(ReduceOp::Max, &t, Some(0), true, &mut cols, usize::MAX, 4).unwrap();
        assert_eq!(cols.to_vec::<f32>().unwrap(), vec![3.0, 4.0, 5.0]);

        let mut mean = Tensor::zeros(&[], DType::F32, &device).unwrap();
        reduce(ReduceOp::Mean, &t, None, false, &mut mean, usize::MAX, 4).unwrap();
        assert_eq!(mean.get::<f32>(&[]).unwrap(), 2.5);
    }

    #[test]
    fn test_reduce_strided_input() {
        let device = cpu();
        let data: Vec<i32> = (0..6).collect();
        let t = Tensor::from_slice(&data, &[2, 3], &device).unwrap().transpose(0, 1).unwrap();
        let mut out = Tensor::zeros(&[3], DType::I32, &device).unwrap();
        reduce(ReduceOp::Min, &t, Some(1), false, &mut out, usize::MAX, 4).unwrap();
        assert_eq!(out.to_vec::<i32>().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_sum_is_thread_count_independent() {
        let device = cpu();
        let data: Vec<f32> = (0..10_000).map(|v| (v as f32).sin() * 1e3).collect();
        let t = Tensor::from_slice(&data, &[10_000], &device).unwrap();
        let mut serial = Tensor::zeros(&[], DType::F32, &device).unwrap();
        let mut parallel = Tensor::zeros(&[], DType::F32, &device).unwrap();
        reduce(ReduceOp::Sum, &t, None, false, &mut serial, usize::MAX, 256).unwrap();
        reduce(ReduceOp::Sum, &t, None, false, &mut parallel, 1, 256).unwrap();
        assert_eq!(
            serial.get::<f32>(&[]).unwrap().to_bits(),
            parallel.get::<f32>(&[]).unwrap().to_bits()
        );
    }

    #[test]
    fn test_empty_reductions() {
        let device = cpu();
        let t = Tensor::zeros(&[0], DType::F64, &device).unwrap();
        let mut out = Tensor::zeros(&[], DType::F64, &device).unwrap();
        reduce(ReduceOp::Sum, &t, None, false, &mut out, usize::MAX, 8).unwrap();
        assert_eq!(out.get::<f64>(&[]).unwrap(), 0.0);
        assert!(matches!(
            reduce(ReduceOp::Max, &t, None, false, &mut out, usize::MAX, 8),
            Err(RuntimeError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_integer_mean() {
        let device = cpu();
        let t = Tensor::from_slice(&[1u8, 2, 4], &[3], &device).unwrap();
        let mut out = Tensor::zeros(&[], DType::U8, &device).unwrap();
        reduce(ReduceOp::Mean, &t, None, false, &mut out, usize::MAX, 8).unwrap();
        assert_eq!(out.get::<u8>(&[]).unwrap(), 2);
    }
}
