//! Strided tensors over shared device buffers
//!
//! - `shape`: element counts, row-major strides, offsets, broadcasting
//! - `dtype`: element types and the typed [`Element`] bridge
//! - `storage`: reference-counted device [`Buffer`]s
//! - `core`: the [`Tensor`] value type with zero-copy views
//! - `math`: eager arithmetic dispatched through the tensor's device

pub mod core;
pub mod dtype;
pub mod math;
pub mod shape;
pub mod storage;

pub use self::core::{Tensor, TensorMeta};
pub use dtype::{DType, Element};
pub use shape::{compute_offset, compute_strides, numel, shape_to_string};
pub use storage::Buffer;
