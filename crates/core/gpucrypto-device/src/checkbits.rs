//! Checkbit buffer
//!
//! One byte per compute block, in host-mapped memory. A kernel stores a
//! non-zero marker into its block's byte as its last action; the host polls
//! the bytes instead of synchronizing the stream.

use std::sync::Arc;

use gpucrypto_mem::{DevicePtr, MappedBuffer, MemoryAllocator};

use crate::error::{DeviceError, DeviceResult};

/// Host-visible completion flags for one stream's kernel launches.
///
/// Capacity is fixed at creation.
#[derive(Debug)]
pub struct CheckbitBuffer {
    buffer: MappedBuffer,
    num_blks: usize,
}

impl CheckbitBuffer {
    /// Allocates `capacity` zeroed checkbits.
    pub fn new(allocator: &Arc<dyn MemoryAllocator>, capacity: usize) -> DeviceResult<Self> {
        let buffer = MappedBuffer::new(allocator, capacity)?;
        Ok(Self {
            buffer,
            num_blks: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Blocks the outstanding launch must mark before it counts as complete.
    pub fn num_blks(&self) -> usize {
        self.num_blks
    }

    /// Zeroes the first `num_blks` checkbits and expects that many markers next.
    pub fn clear(&mut self, num_blks: usize) -> DeviceResult<()> {
        if num_blks > self.capacity() {
            return Err(DeviceError::BlockCountExceeded {
                requested: num_blks,
                capacity: self.capacity(),
            });
        }
        self.buffer.fill(0, num_blks, 0)?;
        self.num_blks = num_blks;
        Ok(())
    }

    /// Whether every expected block has stored its marker.
    pub fn is_complete(&self) -> bool {
        self.buffer.all_nonzero(self.num_blks)
    }

    /// Expected blocks that have stored their marker so far.
    pub fn completed_blocks(&self) -> usize {
        self.buffer.count_nonzero(self.num_blks)
    }

    /// State of one block's checkbit, or `None` past capacity.
    pub fn is_block_complete(&self, block: usize) -> Option<bool> {
        self.buffer.read(block).map(|b| b != 0)
    }

    /// Device address of checkbit 0, for the kernel's final store.
    pub fn device_ptr(&self) -> DevicePtr {
        self.buffer.device_ptr()
    }
}
