use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::dtype::{with_element_type, DType, Element};
use super::shape::{
    broadcast_strides, compute_offset, compute_strides, is_contiguous_strides, numel, shape_to_string,
    StridedOffsets,
};
use super::storage::Buffer;
use crate::device::{Device, DeviceId};
use crate::error::{RuntimeError, RuntimeResult};

/// Shape and element type of a tensor, without storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub fn numel(&self) -> RuntimeResult<usize> {
        numel(&self.shape)
    }

    pub fn nbytes(&self) -> RuntimeResult<usize> {
        Ok(self.numel()? * self.dtype.size())
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, shape_to_string(&self.shape))
    }
}

/// Strided N-dimensional view over a shared [`Buffer`].
///
/// Views (`view`, `reshape` of contiguous data, `permute`, `slice`,
/// `broadcast_to`) share the buffer, so writes through one are visible
/// through the others. `clone` always copies.
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    dtype: DType,
    device: Arc<Device>,
    buffer: Arc<Buffer>,
}

/// Largest element offset of a caller-supplied layout, `None` when empty
fn checked_max_offset(shape: &[usize], strides: &[usize], offset: usize) -> RuntimeResult<Option<usize>> {
    if shape.iter().any(|&d| d == 0) {
        return Ok(None);
    }
    shape
        .iter()
        .zip(strides)
        .try_fold(offset, |acc, (&d, &s)| (d - 1).checked_mul(s).and_then(|step| acc.checked_add(step)))
        .map(Some)
        .ok_or_else(|| {
            RuntimeError::OutOfRange(format!(
                "layout {} with strides {:?} at offset {} overflows the address space",
                shape_to_string(shape),
                strides,
                offset
            ))
        })
}

impl Tensor {
    /// Zero-initialized contiguous tensor
    pub fn zeros(shape: &[usize], dtype: DType, device: &Arc<Device>) -> RuntimeResult<Self> {
        let count = numel(shape)?;
        let buffer = device.alloc(count, dtype)?;
        Ok(Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            offset: 0,
            dtype,
            device: Arc::clone(device),
            buffer,
        })
    }

    /// Allocators hand out zeroed memory, so this is `zeros`.
    pub fn empty(shape: &[usize], dtype: DType, device: &Arc<Device>) -> RuntimeResult<Self> {
        Self::zeros(shape, dtype, device)
    }

    pub fn full(shape: &[usize], dtype: DType, value: f64, device: &Arc<Device>) -> RuntimeResult<Self> {
        let mut tensor = Self::zeros(shape, dtype, device)?;
        tensor.fill_(value)?;
        Ok(tensor)
    }

    pub fn from_slice<T: Element>(data: &[T], shape: &[usize], device: &Arc<Device>) -> RuntimeResult<Self> {
        let count = numel(shape)?;
        if count != data.len() {
            return Err(RuntimeError::shape_mismatch(
                &format!("{} elements for shape {}", count, shape_to_string(shape)),
                &format!("{} values", data.len()),
                None,
            ));
        }
        let mut tensor = Self::zeros(shape, T::DTYPE, device)?;
        tensor.write_from_slice(data)?;
        Ok(tensor)
    }

    pub fn scalar<T: Element>(value: T, device: &Arc<Device>) -> RuntimeResult<Self> {
        Self::from_slice(&[value], &[], device)
    }

    /// Wrap an existing buffer, validating every layout invariant.
    pub fn from_buffer(
        buffer: Arc<Buffer>,
        shape: &[usize],
        strides: &[usize],
        offset: usize,
        device: &Arc<Device>,
    ) -> RuntimeResult<Self> {
        if shape.len() != strides.len() {
            return Err(RuntimeError::RankMismatch {
                expected: shape.len(),
                got: strides.len(),
            });
        }
        if buffer.device() != device.id() {
            return Err(RuntimeError::device_mismatch(device.id(), buffer.device()));
        }
        let tensor = Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
            dtype: buffer.dtype(),
            device: Arc::clone(device),
            buffer,
        };
        if let Some(max) = checked_max_offset(shape, strides, offset)? {
            if max >= tensor.buffer.capacity() {
                return Err(RuntimeError::OutOfRange(format!(
                    "layout reaches element {} of a buffer holding {}",
                    max,
                    tensor.buffer.capacity()
                )));
            }
        }
        Ok(tensor)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Element offset of index `[0, ..., 0]` into the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype.size()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta::new(&self.shape, self.dtype)
    }

    pub fn is_contiguous(&self) -> bool {
        is_contiguous_strides(&self.shape, &self.strides)
    }

    pub fn shares_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// A second handle to the same data and layout
    pub fn shallow_clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            dtype: self.dtype,
            device: Arc::clone(&self.device),
            buffer: Arc::clone(&self.buffer),
        }
    }

    fn with_layout(&self, shape: Vec<usize>, strides: Vec<usize>, offset: usize) -> Self {
        Self {
            shape,
            strides,
            offset,
            dtype: self.dtype,
            device: Arc::clone(&self.device),
            buffer: Arc::clone(&self.buffer),
        }
    }

    fn offsets(&self) -> StridedOffsets {
        StridedOffsets::new(&self.shape, &self.strides, self.offset)
    }

    /// Largest element offset the layout touches, `None` when empty
    fn max_offset(&self) -> Option<usize> {
        if self.shape.iter().any(|&d| d == 0) {
            return None;
        }
        Some(
            self.shape
                .iter()
                .zip(&self.strides)
                .fold(self.offset, |acc, (&d, &s)| acc.saturating_add((d - 1).saturating_mul(s))),
        )
    }

    fn check_element<T: Element>(&self, operation: &str) -> RuntimeResult<()> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::unsupported_dtype(
                self.dtype,
                &format!("{} as {}", operation, T::DTYPE),
            ));
        }
        Ok(())
    }

    fn gather_raw<W: Pod>(&self) -> RuntimeResult<Vec<W>> {
        self.buffer.gather(self.offsets(), self.max_offset())
    }

    fn scatter_raw<W: Pod>(&self, values: &[W]) -> RuntimeResult<()> {
        self.buffer.scatter(self.offsets(), self.max_offset(), values)
    }

    /// Elements in row-major logical order
    pub fn to_vec<T: Element>(&self) -> RuntimeResult<Vec<T>> {
        self.check_element::<T>("to_vec")?;
        self.gather_raw()
    }

    /// Elements converted to `f64`, in row-major logical order
    pub fn to_vec_f64(&self) -> RuntimeResult<Vec<f64>> {
        with_element_type!(self.dtype, "to_vec_f64", T => {
            Ok(self.to_vec::<T>()?.into_iter().map(Element::to_f64).collect())
        })
    }

    /// Overwrite the elements in row-major logical order
    pub fn write_from_slice<T: Element>(&mut self, data: &[T]) -> RuntimeResult<()> {
        self.check_element::<T>("write_from_slice")?;
        self.scatter_raw(data)
    }

    pub fn get<T: Element>(&self, indices: &[usize]) -> RuntimeResult<T> {
        self.check_element::<T>("get")?;
        let off = self.offset + compute_offset(&self.shape, &self.strides, indices)?;
        let mut values: Vec<T> = self.buffer.gather(StridedOffsets::new(&[], &[], off), Some(off))?;
        values
            .pop()
            .ok_or_else(|| RuntimeError::InternalError("single-element read returned nothing".to_string()))
    }

    pub fn get_f64(&self, indices: &[usize]) -> RuntimeResult<f64> {
        with_element_type!(self.dtype, "get_f64", T => Ok(self.get::<T>(indices)?.to_f64()))
    }

    pub fn set<T: Element>(&mut self, indices: &[usize], value: T) -> RuntimeResult<()> {
        self.check_element::<T>("set")?;
        let off = self.offset + compute_offset(&self.shape, &self.strides, indices)?;
        self.buffer.scatter(StridedOffsets::new(&[], &[], off), Some(off), &[value])
    }

    /// Reinterpret contiguous data with a new shape, sharing the buffer
    pub fn view(&self, new_shape: &[usize]) -> RuntimeResult<Self> {
        if !self.is_contiguous() {
            return Err(RuntimeError::NotContiguous(format!(
                "cannot view shape {} with strides {:?} as {}; call contiguous() or reshape()",
                shape_to_string(&self.shape),
                self.strides,
                shape_to_string(new_shape)
            )));
        }
        if numel(new_shape)? != self.numel() {
            return Err(RuntimeError::shape_mismatch(
                &format!("{} elements", self.numel()),
                &format!("{} for shape {}", numel(new_shape)?, shape_to_string(new_shape)),
                None,
            ));
        }
        Ok(self.with_layout(new_shape.to_vec(), compute_strides(new_shape), self.offset))
    }

    /// `view` when contiguous, otherwise a view of a contiguous copy
    pub fn reshape(&self, new_shape: &[usize]) -> RuntimeResult<Self> {
        if self.is_contiguous() {
            self.view(new_shape)
        } else {
            self.contiguous()?.view(new_shape)
        }
    }

    pub fn permute(&self, dims: &[usize]) -> RuntimeResult<Self> {
        let rank = self.ndim();
        if dims.len() != rank {
            return Err(RuntimeError::InvalidPermutation(format!(
                "{:?} has {} entries for a rank-{} tensor",
                dims,
                dims.len(),
                rank
            )));
        }
        let mut seen = vec![false; rank];
        for &d in dims {
            if d >= rank || seen[d] {
                return Err(RuntimeError::InvalidPermutation(format!(
                    "{:?} is not a permutation of 0..{}",
                    dims, rank
                )));
            }
            seen[d] = true;
        }
        let shape = dims.iter().map(|&d| self.shape[d]).collect();
        let strides = dims.iter().map(|&d| self.strides[d]).collect();
        Ok(self.with_layout(shape, strides, self.offset))
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> RuntimeResult<Self> {
        let mut dims: Vec<usize> = (0..self.ndim()).collect();
        if dim0 >= dims.len() || dim1 >= dims.len() {
            return Err(RuntimeError::InvalidPermutation(format!(
                "cannot swap dimensions {} and {} of a rank-{} tensor",
                dim0,
                dim1,
                self.ndim()
            )));
        }
        dims.swap(dim0, dim1);
        self.permute(&dims)
    }

    /// Half-open strided window per dimension; shares the buffer
    pub fn slice(&self, start: &[usize], end: &[usize], step: &[usize]) -> RuntimeResult<Self> {
        let rank = self.ndim();
        for len in [start.len(), end.len(), step.len()] {
            if len != rank {
                return Err(RuntimeError::RankMismatch { expected: rank, got: len });
            }
        }
        let mut shape = Vec::with_capacity(rank);
        let mut strides = Vec::with_capacity(rank);
        let mut offset = self.offset;
        for i in 0..rank {
            if step[i] == 0 || start[i] >= end[i] || end[i] > self.shape[i] {
                return Err(RuntimeError::InvalidRange(format!(
                    "dimension {}: {}..{} step {} for size {}",
                    i, start[i], end[i], step[i], self.shape[i]
                )));
            }
            shape.push((end[i] - start[i]).div_ceil(step[i]));
            strides.push(self.strides[i] * step[i]);
            offset += start[i] * self.strides[i];
        }
        Ok(self.with_layout(shape, strides, offset))
    }

    /// Stride-0 view expanding size-1 dimensions to `shape`
    pub fn broadcast_to(&self, shape: &[usize]) -> RuntimeResult<Self> {
        if shape == self.shape.as_slice() {
            return Ok(self.shallow_clone());
        }
        let strides = broadcast_strides(&self.shape, &self.strides, shape)?;
        Ok(self.with_layout(shape.to_vec(), strides, self.offset))
    }

    /// Same tensor if already contiguous, otherwise a packed copy
    pub fn contiguous(&self) -> RuntimeResult<Self> {
        if self.is_contiguous() {
            return Ok(self.shallow_clone());
        }
        self.clone()
    }

    /// Deep copy into a fresh contiguous buffer, regardless of layout.
    #[allow(clippy::should_implement_trait)]
    pub fn clone(&self) -> RuntimeResult<Self> {
        let mut copy = Self::zeros(&self.shape, self.dtype, &self.device)?;
        copy.copy_strided_from(self)?;
        Ok(copy)
    }

    fn copy_strided_from(&mut self, src: &Tensor) -> RuntimeResult<()> {
        // Gather fully before scattering so overlapping views stay correct.
        match self.dtype.size() {
            1 => self.scatter_raw(&src.gather_raw::<u8>()?),
            2 => self.scatter_raw(&src.gather_raw::<u16>()?),
            4 => self.scatter_raw(&src.gather_raw::<u32>()?),
            8 => self.scatter_raw(&src.gather_raw::<u64>()?),
            n => Err(RuntimeError::InternalError(format!("no raw copy for {}-byte elements", n))),
        }
    }

    pub fn zero_(&mut self) -> RuntimeResult<()> {
        let (offsets, max) = (self.offsets(), self.max_offset());
        match self.dtype.size() {
            1 => self.buffer.splat(offsets, max, 0u8),
            2 => self.buffer.splat(offsets, max, 0u16),
            4 => self.buffer.splat(offsets, max, 0u32),
            8 => self.buffer.splat(offsets, max, 0u64),
            n => Err(RuntimeError::InternalError(format!("no raw fill for {}-byte elements", n))),
        }
    }

    /// Set every element to `value`, converted to the tensor's dtype
    pub fn fill_(&mut self, value: f64) -> RuntimeResult<()> {
        let (offsets, max) = (self.offsets(), self.max_offset());
        with_element_type!(self.dtype, "fill_", T => {
            self.buffer.splat(offsets, max, <T as Element>::from_f64(value))
        })
    }

    /// Element-wise copy in logical order; shapes may differ if counts match
    pub fn copy_(&mut self, src: &Tensor) -> RuntimeResult<()> {
        if src.numel() != self.numel() {
            return Err(RuntimeError::shape_mismatch(
                &format!("{} elements", self.numel()),
                &format!("{} elements", src.numel()),
                None,
            ));
        }
        if src.device_id() != self.device_id() {
            return Err(RuntimeError::device_mismatch(self.device_id(), src.device_id()));
        }
        if src.dtype != self.dtype {
            return Err(RuntimeError::unsupported_dtype(
                src.dtype,
                &format!("copy_ into {}", self.dtype),
            ));
        }
        self.copy_strided_from(src)
    }

    /// Same-device transfer is a no-op; other targets are not implemented
    pub fn to_device(&self, target: &Arc<Device>) -> RuntimeResult<Self> {
        if target.id() == self.device_id() {
            return Ok(self.shallow_clone());
        }
        Err(RuntimeError::NotImplemented(format!(
            "transfer from {} to {}",
            self.device_id(),
            target.id()
        )))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .field("dtype", &self.dtype)
            .field("device", &self.device_id().to_string())
            .field("buffer", &self.buffer.id())
            .finish()
    }
}
