use bytemuck::Pod;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::dtype::DType;
use super::shape::StridedOffsets;
use crate::device::{Allocator, DeviceId};
use crate::error::{RuntimeError, RuntimeResult};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-size block of device memory tagged with an element type.
///
/// Buffers are shared through `Arc`; the memory goes back to the owning
/// allocator when the last holder drops. Concurrent writes to one buffer
/// from several threads are the caller's responsibility.
pub struct Buffer {
    ptr: NonNull<u8>,
    nbytes: usize,
    dtype: DType,
    device: DeviceId,
    allocator: Arc<dyn Allocator>,
    id: u64,
}

// The pointer is owned by this buffer and only released in Drop.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(ptr: NonNull<u8>, nbytes: usize, dtype: DType, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            ptr,
            nbytes,
            dtype,
            device: allocator.device(),
            allocator,
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of whole elements the buffer can hold
    pub fn capacity(&self) -> usize {
        self.nbytes / self.dtype.size()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Process-unique identity, stable for the buffer's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    fn host_base(&self) -> RuntimeResult<*mut u8> {
        if !self.allocator.is_host_accessible() {
            return Err(RuntimeError::UnsupportedOperation(format!(
                "buffer on {} is not host accessible",
                self.device
            )));
        }
        Ok(self.ptr.as_ptr())
    }

    fn check_extent(&self, offsets: &StridedOffsets, elem_size: usize, max_offset: Option<usize>) -> RuntimeResult<()> {
        if offsets.len() == 0 {
            return Ok(());
        }
        let end = max_offset
            .and_then(|m| m.checked_add(1))
            .and_then(|n| n.checked_mul(elem_size))
            .unwrap_or(usize::MAX);
        if end > self.nbytes {
            return Err(RuntimeError::OutOfRange(format!(
                "access up to byte {} exceeds buffer of {} bytes",
                end, self.nbytes
            )));
        }
        Ok(())
    }

    /// Read the elements at `offsets` (in units of `T`) in iteration order.
    pub(crate) fn gather<T: Pod>(&self, offsets: StridedOffsets, max_offset: Option<usize>) -> RuntimeResult<Vec<T>> {
        self.check_extent(&offsets, std::mem::size_of::<T>(), max_offset)?;
        let base = self.host_base()? as *const T;
        // Extent checked above; unaligned reads tolerate any element offset.
        Ok(offsets
            .map(|off| unsafe { base.add(off).read_unaligned() })
            .collect())
    }

    /// Write `values` to the elements at `offsets` (in units of `T`).
    pub(crate) fn scatter<T: Pod>(
        &self,
        offsets: StridedOffsets,
        max_offset: Option<usize>,
        values: &[T],
    ) -> RuntimeResult<()> {
        if offsets.len() != values.len() {
            return Err(RuntimeError::shape_mismatch(
                &format!("{} elements", offsets.len()),
                &format!("{} values", values.len()),
                None,
            ));
        }
        self.check_extent(&offsets, std::mem::size_of::<T>(), max_offset)?;
        let base = self.host_base()? as *mut T;
        for (off, value) in offsets.zip(values) {
            unsafe { base.add(off).write_unaligned(*value) };
        }
        Ok(())
    }

    /// Write one value to every element at `offsets`.
    pub(crate) fn splat<T: Pod>(&self, offsets: StridedOffsets, max_offset: Option<usize>, value: T) -> RuntimeResult<()> {
        self.check_extent(&offsets, std::mem::size_of::<T>(), max_offset)?;
        let base = self.host_base()? as *mut T;
        for off in offsets {
            unsafe { base.add(off).write_unaligned(value) };
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.ptr, self.nbytes) };
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("nbytes", &self.nbytes)
            .field("dtype", &self.dtype)
            .field("device", &self.device.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn test_gather_scatter_strided() {
        let device = Device::cpu(0);
        let buffer = device.alloc(6, DType::F32).unwrap();
        let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
        buffer.scatter(StridedOffsets::new(&[2, 3], &[3, 1], 0), Some(5), &values).unwrap();

        // Column 1 of the [2, 3] matrix.
        let column: Vec<f32> = buffer.gather(StridedOffsets::new(&[2], &[3], 1), Some(4)).unwrap();
        assert_eq!(column, vec![1.0, 4.0]);
    }

    #[test]
    fn test_out_of_extent_access_fails() {
        let device = Device::cpu(0);
        let buffer = device.alloc(4, DType::F32).unwrap();
        let result: RuntimeResult<Vec<f32>> = buffer.gather(StridedOffsets::new(&[5], &[1], 0), Some(4));
        assert!(matches!(result, Err(RuntimeError::OutOfRange(_))));
    }

    #[test]
    fn test_buffer_ids_are_unique() {
        let device = Device::cpu(0);
        let a = device.alloc(1, DType::U8).unwrap();
        let b = device.alloc(1, DType::U8).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.capacity(), 1);
    }
}
