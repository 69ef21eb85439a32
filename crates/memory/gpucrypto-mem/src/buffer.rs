//! RAII ownership of device and host-mapped allocations

use std::fmt;
use std::ptr;
use std::sync::Arc;

use gpucrypto_osal::{barrier_acquire, barrier_release};

use crate::allocator::{DevicePtr, MappedRegion, MemoryAllocator};
use crate::error::{MemError, MemResult};

/// Device-resident allocation, released on drop.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    allocator: Arc<dyn MemoryAllocator>,
}

impl DeviceBuffer {
    pub fn new(allocator: &Arc<dyn MemoryAllocator>, len: usize) -> MemResult<Self> {
        let ptr = allocator.alloc_device(len)?;
        Ok(Self {
            ptr,
            len,
            allocator: Arc::clone(allocator),
        })
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free_device(self.ptr) {
            log::warn!("failed to free device buffer {:?}: {}", self.ptr, e);
        }
    }
}

/// Host-mapped allocation visible to both host and device, released on drop.
///
/// Host accesses are volatile so that bytes stored by the device through
/// [`device_ptr`](Self::device_ptr) are observed by polling, without any
/// blocking synchronize.
pub struct MappedBuffer {
    region: MappedRegion,
    allocator: Arc<dyn MemoryAllocator>,
}

impl MappedBuffer {
    /// Allocates `len` mapped bytes and zeroes them.
    pub fn new(allocator: &Arc<dyn MemoryAllocator>, len: usize) -> MemResult<Self> {
        let region = allocator.alloc_mapped(len)?;
        let buffer = Self {
            region,
            allocator: Arc::clone(allocator),
        };
        buffer.fill(0, len, 0)?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.region.device
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.region.host.as_ptr()
    }

    /// Volatile read of one byte.
    #[inline]
    pub fn read(&self, index: usize) -> Option<u8> {
        if index < self.region.len {
            // SAFETY: index is in bounds of a live mapping owned by self.
            Some(unsafe { ptr::read_volatile(self.host_ptr().add(index)) })
        } else {
            None
        }
    }

    /// Volatile write of one byte. Returns `false` if `index` is out of range.
    #[inline]
    pub fn write(&self, index: usize, value: u8) -> bool {
        if index < self.region.len {
            // SAFETY: index is in bounds of a live mapping owned by self.
            unsafe { ptr::write_volatile(self.host_ptr().add(index), value) };
            true
        } else {
            false
        }
    }

    /// Sets `len` bytes starting at `offset` to `value` and publishes them.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> MemResult<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above.
        unsafe { ptr::write_bytes(self.host_ptr().add(offset), value, len) };
        barrier_release();
        Ok(())
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn copy_from(&self, offset: usize, data: &[u8]) -> MemResult<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked above; `data` cannot alias a mapping we own.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.host_ptr().add(offset), data.len())
        };
        barrier_release();
        Ok(())
    }

    /// Copies bytes at `offset` out into `out`.
    pub fn copy_to(&self, offset: usize, out: &mut [u8]) -> MemResult<()> {
        self.check_range(offset, out.len())?;
        barrier_acquire();
        // SAFETY: range checked above.
        unsafe { ptr::copy_nonoverlapping(self.host_ptr().add(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Number of non-zero bytes among the first `len`.
    pub fn count_nonzero(&self, len: usize) -> usize {
        let len = len.min(self.region.len);
        let count = (0..len).filter(|&i| self.read(i) != Some(0)).count();
        barrier_acquire();
        count
    }

    /// Whether each of the first `len` bytes is non-zero.
    ///
    /// Stops at the first zero byte.
    pub fn all_nonzero(&self, len: usize) -> bool {
        if len > self.region.len {
            return false;
        }
        let done = (0..len).all(|i| self.read(i) != Some(0));
        if done {
            barrier_acquire();
        }
        done
    }

    fn check_range(&self, offset: usize, len: usize) -> MemResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.region.len => Ok(()),
            _ => Err(MemError::OutOfBounds {
                offset,
                len,
                capacity: self.region.len,
            }),
        }
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("device", &self.region.device)
            .field("len", &self.region.len)
            .finish()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free_mapped(self.region) {
            log::warn!("failed to free mapped buffer {:?}: {}", self.region.device, e);
        }
    }
}

// SAFETY: all host access goes through volatile reads/writes with explicit
// fences; the region itself stays valid until drop.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}
