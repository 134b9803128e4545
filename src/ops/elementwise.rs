//! Elementwise operators with NumPy broadcasting

use serde::{Deserialize, Serialize};

use super::map_indexed;
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::dtype::{with_element_type, Element};
use crate::tensor::shape::{broadcast_shapes, shape_to_string};
use crate::tensor::{DType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 6] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Maximum,
        BinaryOp::Minimum,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }

    /// Operand order does not affect the result, bit for bit.
    /// `maximum`/`minimum` are excluded: they keep the left operand on ties
    /// and NaN, so swapping operands changes signed zeros and NaNs.
    pub const fn is_commutative(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul)
    }

    pub fn apply<T: Element>(&self, a: T, b: T) -> RuntimeResult<T> {
        Ok(match self {
            BinaryOp::Add => a.add(b),
            BinaryOp::Sub => a.sub(b),
            BinaryOp::Mul => a.mul(b),
            BinaryOp::Div => a
                .checked_div(b)
                .ok_or_else(|| RuntimeError::InvalidInput("integer division by zero".to_string()))?,
            BinaryOp::Maximum => a.maximum(b),
            BinaryOp::Minimum => a.minimum(b),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Exp,
    Sqrt,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 5] = [UnaryOp::Neg, UnaryOp::Abs, UnaryOp::Relu, UnaryOp::Exp, UnaryOp::Sqrt];

    pub const fn name(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Relu => "relu",
            UnaryOp::Exp => "exp",
            UnaryOp::Sqrt => "sqrt",
        }
    }

    pub const fn float_only(&self) -> bool {
        matches!(self, UnaryOp::Exp | UnaryOp::Sqrt)
    }

    pub fn apply<T: Element>(&self, x: T) -> T {
        match self {
            UnaryOp::Neg => x.neg(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Relu => x.maximum(T::zero()),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }
}

/// Tensor-with-constant operators; the constant arrives as float attr `scalar`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarOp {
    AddScalar,
    MulScalar,
}

impl ScalarOp {
    pub const ALL: [ScalarOp; 2] = [ScalarOp::AddScalar, ScalarOp::MulScalar];

    pub const fn name(&self) -> &'static str {
        match self {
            ScalarOp::AddScalar => "add_scalar",
            ScalarOp::MulScalar => "mul_scalar",
        }
    }

    pub fn apply<T: Element>(&self, x: T, scalar: T) -> T {
        match self {
            ScalarOp::AddScalar => x.add(scalar),
            ScalarOp::MulScalar => x.mul(scalar),
        }
    }
}

/// One elementwise step with its parameters resolved
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ElementwiseOp {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Scalar(ScalarOp, f64),
}

impl ElementwiseOp {
    pub fn arity(&self) -> usize {
        match self {
            ElementwiseOp::Binary(_) => 2,
            ElementwiseOp::Unary(_) | ElementwiseOp::Scalar(..) => 1,
        }
    }

    pub fn eval<T: Element>(&self, args: &[T]) -> RuntimeResult<T> {
        match self {
            ElementwiseOp::Binary(op) => op.apply(args[0], args[1]),
            ElementwiseOp::Unary(op) => Ok(op.apply(args[0])),
            ElementwiseOp::Scalar(op, s) => Ok(op.apply(args[0], T::from_f64(*s))),
        }
    }
}

fn check_dtypes(op: &str, tensors: &[&Tensor], out: &Tensor) -> RuntimeResult<DType> {
    let dtype = out.dtype();
    for t in tensors {
        if t.dtype() != dtype {
            return Err(RuntimeError::unsupported_dtype(
                t.dtype(),
                &format!("{} with {} output", op, dtype),
            ));
        }
    }
    Ok(dtype)
}

fn check_out_shape(op: &str, expected: &[usize], out: &Tensor) -> RuntimeResult<()> {
    if out.shape() != expected {
        return Err(RuntimeError::shape_mismatch(
            &shape_to_string(expected),
            &shape_to_string(out.shape()),
            Some(&format!("output of '{}' has the wrong shape", op)),
        ));
    }
    Ok(())
}

/// `out = op(a, b)` with broadcasting
pub fn binary(op: BinaryOp, a: &Tensor, b: &Tensor, out: &mut Tensor, threshold: usize) -> RuntimeResult<()> {
    let dtype = check_dtypes(op.name(), &[a, b], out)?;
    let shape = broadcast_shapes(a.shape(), b.shape())?;
    check_out_shape(op.name(), &shape, out)?;
    let lhs = a.broadcast_to(&shape)?;
    let rhs = b.broadcast_to(&shape)?;
    with_element_type!(dtype, op.name(), T => {
        let x = lhs.to_vec::<T>()?;
        let y = rhs.to_vec::<T>()?;
        let result = map_indexed(x.len(), threshold, |i| op.apply(x[i], y[i]))?;
        out.write_from_slice(&result)
    })
}

pub fn unary(op: UnaryOp, a: &Tensor, out: &mut Tensor, threshold: usize) -> RuntimeResult<()> {
    let dtype = check_dtypes(op.name(), &[a], out)?;
    if op.float_only() && !dtype.is_float() {
        return Err(RuntimeError::unsupported_dtype(dtype, op.name()));
    }
    check_out_shape(op.name(), a.shape(), out)?;
    with_element_type!(dtype, op.name(), T => {
        let x = a.to_vec::<T>()?;
        let result = map_indexed(x.len(), threshold, |i| Ok(op.apply(x[i])))?;
        out.write_from_slice(&result)
    })
}

pub fn scalar(op: ScalarOp, a: &Tensor, value: f64, out: &mut Tensor, threshold: usize) -> RuntimeResult<()> {
    let dtype = check_dtypes(op.name(), &[a], out)?;
    check_out_shape(op.name(), a.shape(), out)?;
    with_element_type!(dtype, op.name(), T => {
        let s = <T as Element>::from_f64(value);
        let x = a.to_vec::<T>()?;
        let result = map_indexed(x.len(), threshold, |i| Ok(op.apply(x[i], s)))?;
        out.write_from_slice(&result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::sync::Arc;

    fn cpu() -> Arc<Device> {
        Arc::new(Device::cpu(0))
    }

    #[test]
    fn test_binary_broadcast() {
        let device = cpu();
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &device).unwrap();
        let b = Tensor::from_slice(&[10.0f32, 20.0, 30.0], &[3], &device).unwrap();
        let mut out = Tensor::zeros(&[2, 3], DType::F32, &device).unwrap();
        binary(BinaryOp::Add, &a, &b, &mut out, usize::MAX).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_binary_parallel_matches_serial() {
        let device = cpu();
        let data: Vec<f64> = (0..5000).map(|v| v as f64 * 0.37).collect();
        let a = Tensor::from_slice(&data, &[5000], &device).unwrap();
        let mut serial = Tensor::zeros(&[5000], DType::F64, &device).unwrap();
        let mut parallel = Tensor::zeros(&[5000], DType::F64, &device).unwrap();
        binary(BinaryOp::Mul, &a, &a, &mut serial, usize::MAX).unwrap();
        binary(BinaryOp::Mul, &a, &a, &mut parallel, 1).unwrap();
        assert_eq!(serial.to_vec::<f64>().unwrap(), parallel.to_vec::<f64>().unwrap());
    }

    #[test]
    fn test_integer_division_by_zero() {
        let device = cpu();
        let a = Tensor::from_slice(&[4i32, 9], &[2], &device).unwrap();
        let b = Tensor::from_slice(&[2i32, 0], &[2], &device).unwrap();
        let mut out = Tensor::zeros(&[2], DType::I32, &device).unwrap();
        assert!(matches!(
            binary(BinaryOp::Div, &a, &b, &mut out, usize::MAX),
            Err(RuntimeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dtype_and_shape_checks() {
        let device = cpu();
        let a = Tensor::zeros(&[3], DType::F32, &device).unwrap();
        let b = Tensor::zeros(&[3], DType::F64, &device).unwrap();
        let mut out = Tensor::zeros(&[3], DType::F32, &device).unwrap();
        assert!(matches!(
            binary(BinaryOp::Add, &a, &b, &mut out, usize::MAX),
            Err(RuntimeError::UnsupportedDType { .. })
        ));
        let mut wrong = Tensor::zeros(&[4], DType::F32, &device).unwrap();
        assert!(matches!(
            unary(UnaryOp::Neg, &a, &mut wrong, usize::MAX),
            Err(RuntimeError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_unary_ops() {
        let device = cpu();
        let a = Tensor::from_slice(&[-2.0f32, 0.0, 4.0], &[3], &device).unwrap();
        let mut out = Tensor::zeros(&[3], DType::F32, &device).unwrap();
        unary(UnaryOp::Relu, &a, &mut out, usize::MAX).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![0.0, 0.0, 4.0]);
        unary(UnaryOp::Abs, &a, &mut out, usize::MAX).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![2.0, 0.0, 4.0]);

        let ints = Tensor::from_slice(&[4i32], &[1], &device).unwrap();
        let mut int_out = Tensor::zeros(&[1], DType::I32, &device).unwrap();
        assert!(matches!(
            unary(UnaryOp::Sqrt, &ints, &mut int_out, usize::MAX),
            Err(RuntimeError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_scalar_ops() {
        let device = cpu();
        let a = Tensor::from_slice(&[1i64, 2, 3], &[3], &device).unwrap();
        let mut out = Tensor::zeros(&[3], DType::I64, &device).unwrap();
        scalar(ScalarOp::MulScalar, &a, 3.0, &mut out, usize::MAX).unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![3, 6, 9]);
    }

    #[test]
    fn test_elementwise_eval() {
        let add = ElementwiseOp::Binary(BinaryOp::Add);
        assert_eq!(add.arity(), 2);
        assert_eq!(add.eval(&[1.5f32, 2.0]).unwrap(), 3.5);
        let shift = ElementwiseOp::Scalar(ScalarOp::AddScalar, -1.0);
        assert_eq!(shift.eval(&[5u8]).unwrap(), 4);
    }
}
