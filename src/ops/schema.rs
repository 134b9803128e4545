//! Op schemas: arity, dtype rules and output shapes of the builtin ops.
//!
//! Ops without a schema are opaque custom kernels to the optimizer.

use super::elementwise::{BinaryOp, ElementwiseOp, ScalarOp, UnaryOp};
use super::reduce::{reduced_shape, ReduceOp};
use crate::device::KernelAttributes;
use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::shape::broadcast_shapes;
use crate::tensor::TensorMeta;

/// Name of the composite op emitted by fusion
pub const FUSED_ELEMENTWISE: &str = "fused_elementwise";

const ALIASES: &[(&str, &str)] = &[
    ("plus", "add"),
    ("subtract", "sub"),
    ("minus", "sub"),
    ("multiply", "mul"),
    ("times", "mul"),
    ("divide", "div"),
    ("truediv", "div"),
    ("max_elementwise", "maximum"),
    ("min_elementwise", "minimum"),
    ("negative", "neg"),
    ("absolute", "abs"),
    ("reduce_sum", "sum"),
    ("reduce_mean", "mean"),
    ("reduce_max", "max"),
    ("reduce_min", "min"),
    ("copy", "identity"),
];

/// Lowercased op name with known aliases resolved
pub fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lower)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Scalar(ScalarOp),
    Reduce(ReduceOp),
    Identity,
}

impl OpKind {
    /// Every builtin op, in registration order
    pub fn all() -> Vec<OpKind> {
        let mut kinds: Vec<OpKind> = BinaryOp::ALL.iter().map(|&op| OpKind::Binary(op)).collect();
        kinds.extend(UnaryOp::ALL.iter().map(|&op| OpKind::Unary(op)));
        kinds.extend(ScalarOp::ALL.iter().map(|&op| OpKind::Scalar(op)));
        kinds.extend(ReduceOp::ALL.iter().map(|&op| OpKind::Reduce(op)));
        kinds.push(OpKind::Identity);
        kinds
    }

    /// Resolve a possibly aliased op name
    pub fn lookup(name: &str) -> Option<OpKind> {
        let canonical = canonical_name(name);
        Self::all().into_iter().find(|kind| kind.name() == canonical)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Binary(op) => op.name(),
            OpKind::Unary(op) => op.name(),
            OpKind::Scalar(op) => op.name(),
            OpKind::Reduce(op) => op.name(),
            OpKind::Identity => "identity",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            OpKind::Binary(_) => 2,
            _ => 1,
        }
    }

    pub fn is_elementwise(&self) -> bool {
        matches!(self, OpKind::Binary(_) | OpKind::Unary(_) | OpKind::Scalar(_))
    }

    /// The fusable form of this op, if it is elementwise
    pub fn elementwise(&self, attrs: &KernelAttributes) -> RuntimeResult<Option<ElementwiseOp>> {
        Ok(match self {
            OpKind::Binary(op) => Some(ElementwiseOp::Binary(*op)),
            OpKind::Unary(op) => Some(ElementwiseOp::Unary(*op)),
            OpKind::Scalar(op) => Some(ElementwiseOp::Scalar(*op, attrs.require_float("scalar")?)),
            OpKind::Reduce(_) | OpKind::Identity => None,
        })
    }

    /// Output metadata for the given inputs
    pub fn infer(&self, inputs: &[TensorMeta], attrs: &KernelAttributes) -> RuntimeResult<TensorMeta> {
        if inputs.len() != self.arity() {
            return Err(RuntimeError::InvalidGraph(format!(
                "'{}' takes {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }
        let dtype = inputs[0].dtype;
        if !matches!(self, OpKind::Identity) && !dtype.is_numeric() {
            return Err(RuntimeError::unsupported_dtype(dtype, self.name()));
        }
        match self {
            OpKind::Binary(_) => {
                if inputs[1].dtype != dtype {
                    return Err(RuntimeError::unsupported_dtype(
                        inputs[1].dtype,
                        &format!("{} with {}", self.name(), dtype),
                    ));
                }
                Ok(TensorMeta {
                    shape: broadcast_shapes(&inputs[0].shape, &inputs[1].shape)?,
                    dtype,
                })
            }
            OpKind::Unary(op) => {
                if op.float_only() && !dtype.is_float() {
                    return Err(RuntimeError::unsupported_dtype(dtype, op.name()));
                }
                Ok(inputs[0].clone())
            }
            OpKind::Scalar(_) => {
                attrs.require_float("scalar")?;
                Ok(inputs[0].clone())
            }
            OpKind::Reduce(_) => {
                let axis = reduce_axis(attrs, inputs[0].shape.len())?;
                Ok(TensorMeta {
                    shape: reduced_shape(&inputs[0].shape, axis, keepdim(attrs)),
                    dtype,
                })
            }
            OpKind::Identity => Ok(inputs[0].clone()),
        }
    }
}

/// The `axis` attribute normalized against `rank`; `None` reduces everything
pub fn reduce_axis(attrs: &KernelAttributes, rank: usize) -> RuntimeResult<Option<usize>> {
    match attrs.int("axis") {
        None => Ok(None),
        Some(axis) => {
            let resolved = if axis < 0 { axis + rank as i64 } else { axis };
            if resolved < 0 || resolved >= rank as i64 {
                return Err(RuntimeError::OutOfRange(format!(
                    "axis {} for a rank-{} tensor",
                    axis, rank
                )));
            }
            Ok(Some(resolved as usize))
        }
    }
}

pub fn keepdim(attrs: &KernelAttributes) -> bool {
    attrs.int("keepdim").map(|v| v != 0).unwrap_or(false)
}
