//! Per-stream bump pools
//!
//! Each stream owns one device pool and one pinned (host-mapped) pool, sized
//! once at context init. Allocation only moves a cursor forward; `reset`
//! rewinds it between batches. Nothing is returned to the allocator until
//! the pool itself is dropped.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::{DevicePtr, MemoryAllocator};
use crate::buffer::{DeviceBuffer, MappedBuffer};
use crate::error::{MemError, MemResult};

/// Alignment of every pool allocation, matching device allocation granularity.
pub const POOL_ALIGNMENT: usize = 256;

#[derive(Debug, Clone, Copy)]
struct BumpCursor {
    capacity: usize,
    used: usize,
}

impl BumpCursor {
    fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    fn take(&mut self, len: usize) -> MemResult<usize> {
        if len == 0 {
            return Err(MemError::ZeroSized);
        }
        let start = self.used.next_multiple_of(POOL_ALIGNMENT);
        let remaining = self.capacity.saturating_sub(start);
        if len > remaining {
            return Err(MemError::PoolExhausted {
                requested: len,
                remaining,
            });
        }
        self.used = start + len;
        Ok(start)
    }

    fn remaining(&self) -> usize {
        self.capacity
            .saturating_sub(self.used.next_multiple_of(POOL_ALIGNMENT))
    }
}

/// Bump allocator over one device-resident buffer.
#[derive(Debug)]
pub struct DevicePool {
    buffer: DeviceBuffer,
    cursor: BumpCursor,
}

impl DevicePool {
    pub fn new(allocator: &Arc<dyn MemoryAllocator>, capacity: usize) -> MemResult<Self> {
        let buffer = DeviceBuffer::new(allocator, capacity)?;
        Ok(Self {
            buffer,
            cursor: BumpCursor::new(capacity),
        })
    }

    /// Carves `len` bytes out of the pool.
    pub fn alloc(&mut self, len: usize) -> MemResult<DevicePtr> {
        let offset = self.cursor.take(len)?;
        Ok(self.buffer.device_ptr().offset(offset))
    }

    /// Forgets every allocation made since the last reset.
    pub fn reset(&mut self) {
        self.cursor.used = 0;
    }

    pub fn capacity(&self) -> usize {
        self.cursor.capacity
    }

    pub fn used(&self) -> usize {
        self.cursor.used
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Start of the backing device buffer.
    pub fn base(&self) -> DevicePtr {
        self.buffer.device_ptr()
    }
}

/// A slice of a [`PinnedPool`], addressable from host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedRegion {
    pub offset: usize,
    pub len: usize,
    pub device: DevicePtr,
}

/// Bump allocator over one host-mapped buffer, used for staging transfers.
#[derive(Debug)]
pub struct PinnedPool {
    buffer: MappedBuffer,
    cursor: BumpCursor,
}

impl PinnedPool {
    pub fn new(allocator: &Arc<dyn MemoryAllocator>, capacity: usize) -> MemResult<Self> {
        let buffer = MappedBuffer::new(allocator, capacity)?;
        Ok(Self {
            buffer,
            cursor: BumpCursor::new(capacity),
        })
    }

    pub fn alloc(&mut self, len: usize) -> MemResult<PinnedRegion> {
        let offset = self.cursor.take(len)?;
        Ok(PinnedRegion {
            offset,
            len,
            device: self.buffer.device_ptr().offset(offset),
        })
    }

    pub fn reset(&mut self) {
        self.cursor.used = 0;
    }

    /// Host address of a region handed out by this pool.
    pub fn host_ptr(&self, region: &PinnedRegion) -> MemResult<NonNull<u8>> {
        self.check(region)?;
        // SAFETY: check() bounds the offset within the live mapping, whose
        // base pointer is non-null.
        Ok(unsafe { NonNull::new_unchecked(self.buffer.host_ptr().add(region.offset)) })
    }

    /// Writes `data` into the start of `region`.
    pub fn write(&self, region: &PinnedRegion, data: &[u8]) -> MemResult<()> {
        self.check(region)?;
        if data.len() > region.len {
            return Err(MemError::OutOfBounds {
                offset: region.offset,
                len: data.len(),
                capacity: region.len,
            });
        }
        self.buffer.copy_from(region.offset, data)
    }

    /// Reads the start of `region` into `out`.
    pub fn read(&self, region: &PinnedRegion, out: &mut [u8]) -> MemResult<()> {
        self.check(region)?;
        if out.len() > region.len {
            return Err(MemError::OutOfBounds {
                offset: region.offset,
                len: out.len(),
                capacity: region.len,
            });
        }
        self.buffer.copy_to(region.offset, out)
    }

    pub fn capacity(&self) -> usize {
        self.cursor.capacity
    }

    pub fn used(&self) -> usize {
        self.cursor.used
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    fn check(&self, region: &PinnedRegion) -> MemResult<()> {
        let in_bounds = region
            .offset
            .checked_add(region.len)
            .is_some_and(|end| end <= self.cursor.capacity);
        if in_bounds && region.device == self.buffer.device_ptr().offset(region.offset) {
            Ok(())
        } else {
            Err(MemError::OutOfBounds {
                offset: region.offset,
                len: region.len,
                capacity: self.cursor.capacity,
            })
        }
    }
}
