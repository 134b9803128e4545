//! Device memory allocators

use parking_lot::{Mutex, RwLock};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use super::DeviceId;
use crate::config::MemoryConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Raw memory strategy for exactly one device.
///
/// Implementations hand out non-null blocks or fail with `OutOfMemory`;
/// freeing a block twice is undefined behavior.
pub trait Allocator: Send + Sync {
    /// The device whose memory this allocator manages
    fn device(&self) -> DeviceId;

    fn allocate(&self, nbytes: usize) -> RuntimeResult<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `allocate(nbytes)` on this allocator and must not
    /// be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, nbytes: usize);

    /// Whether the host may dereference pointers from this allocator
    fn is_host_accessible(&self) -> bool;

    fn stats(&self) -> AllocatorStats;
}

/// Memory allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub allocations: usize,
    pub pool_hits: usize,
    pub pooled_bytes: usize,
}

/// Host allocator with cache-line alignment and a per-size block pool
pub struct CpuAllocator {
    device: DeviceId,
    alignment: usize,
    max_pooled_per_size: usize,
    limit: Option<usize>,
    pools: RwLock<HashMap<usize, Vec<NonNull<u8>>>>,
    stats: Mutex<AllocatorStats>,
}

// Pooled pointers are exclusively owned by the allocator.
unsafe impl Send for CpuAllocator {}
unsafe impl Sync for CpuAllocator {}

impl CpuAllocator {
    pub fn new(device: DeviceId) -> Self {
        Self::with_config(device, &MemoryConfig::default())
    }

    pub fn with_config(device: DeviceId, config: &MemoryConfig) -> Self {
        Self {
            device,
            alignment: config.alignment.max(1),
            max_pooled_per_size: config.max_pooled_per_size,
            limit: config.device_memory_limit,
            pools: RwLock::new(HashMap::new()),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn layout(&self, nbytes: usize) -> RuntimeResult<Layout> {
        Layout::from_size_align(nbytes, self.alignment)
            .map_err(|e| RuntimeError::out_of_memory(nbytes, &format!("invalid layout: {}", e)))
    }

    fn take_pooled(&self, nbytes: usize) -> Option<NonNull<u8>> {
        let mut pools = self.pools.write();
        pools.get_mut(&nbytes).and_then(|pool| pool.pop())
    }

    /// Count `nbytes` against the device limit. The check and the update
    /// happen under one lock so concurrent callers cannot overshoot.
    fn reserve(&self, nbytes: usize) -> RuntimeResult<()> {
        let mut stats = self.stats.lock();
        let requested = stats.bytes_in_use.saturating_add(nbytes);
        if let Some(limit) = self.limit {
            if requested > limit {
                return Err(RuntimeError::out_of_memory(
                    nbytes,
                    &format!("{} limit of {} bytes reached", self.device, limit),
                ));
            }
        }
        stats.bytes_in_use = requested;
        Ok(())
    }

    fn obtain(&self, nbytes: usize) -> RuntimeResult<NonNull<u8>> {
        if nbytes == 0 {
            return Ok(NonNull::dangling());
        }
        if let Some(ptr) = self.take_pooled(nbytes) {
            // Fresh allocations are zeroed; keep pooled reuse consistent.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, nbytes) };
            let mut stats = self.stats.lock();
            stats.pool_hits += 1;
            stats.pooled_bytes -= nbytes;
            return Ok(ptr);
        }
        let layout = self.layout(nbytes)?;
        let raw = unsafe { alloc_zeroed(layout) };
        NonNull::new(raw).ok_or_else(|| RuntimeError::out_of_memory(nbytes, &self.device.to_string()))
    }

    /// Release every pooled block back to the system
    pub fn clear_pools(&self) {
        let mut pools = self.pools.write();
        for (size, pool) in pools.iter_mut() {
            for ptr in pool.drain(..) {
                // Pooled blocks were allocated with this exact layout.
                unsafe {
                    let layout = Layout::from_size_align_unchecked(*size, self.alignment);
                    dealloc(ptr.as_ptr(), layout);
                }
            }
        }
        self.stats.lock().pooled_bytes = 0;
    }
}

impl Allocator for CpuAllocator {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn allocate(&self, nbytes: usize) -> RuntimeResult<NonNull<u8>> {
        self.reserve(nbytes)?;
        match self.obtain(nbytes) {
            Ok(ptr) => {
                let mut stats = self.stats.lock();
                stats.allocations += 1;
                stats.peak_bytes = stats.peak_bytes.max(stats.bytes_in_use);
                tracing::trace!(device = %self.device, nbytes, "allocate");
                Ok(ptr)
            }
            Err(e) => {
                let mut stats = self.stats.lock();
                stats.bytes_in_use = stats.bytes_in_use.saturating_sub(nbytes);
                Err(e)
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, nbytes: usize) {
        {
            let mut stats = self.stats.lock();
            stats.bytes_in_use = stats.bytes_in_use.saturating_sub(nbytes);
        }
        if nbytes == 0 {
            return;
        }

        let mut pools = self.pools.write();
        let pool = pools.entry(nbytes).or_default();
        if pool.len() < self.max_pooled_per_size {
            pool.push(ptr);
            self.stats.lock().pooled_bytes += nbytes;
        } else {
            tracing::warn!(nbytes, "allocator pool full, releasing block");
            dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(nbytes, self.alignment));
        }
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    fn stats(&self) -> AllocatorStats {
        self.stats.lock().clone()
    }
}

impl Drop for CpuAllocator {
    fn drop(&mut self) {
        self.clear_pools();
    }
}
