//! Builtin operator set: definitions, host implementations and schemas
//!
//! Host implementations work on host-accessible tensors and are what the
//! CPU backend registers as kernels. Parallel paths use rayon when the
//! `parallel` feature is on and the problem is large enough.

pub mod elementwise;
pub mod fused;
pub mod reduce;
pub mod schema;

pub use elementwise::{BinaryOp, ElementwiseOp, ScalarOp, UnaryOp};
pub use fused::{FusedChain, FusedStep, Operand};
pub use reduce::ReduceOp;
pub use schema::{canonical_name, OpKind};

use crate::error::RuntimeResult;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Evaluate `f` for every index in `0..n`, in parallel above `threshold`.
///
/// Each index is computed independently, so the result never depends on
/// how the work is split.
pub(crate) fn map_indexed<T, F>(n: usize, threshold: usize, f: F) -> RuntimeResult<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> RuntimeResult<T> + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        if n >= threshold {
            return (0..n).into_par_iter().map(f).collect();
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = threshold;
    (0..n).map(f).collect()
}
