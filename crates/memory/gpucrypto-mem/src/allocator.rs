//! Allocation capability consumed by the scheduling core

use std::fmt;
use std::ptr::NonNull;

use crate::error::MemResult;

/// Address in the device's virtual address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    /// Pointer `bytes` past this one.
    ///
    /// Wraps around the address space; consumers such as
    /// [`HostAllocator::device_store`](crate::HostAllocator::device_store)
    /// reject addresses outside a live allocation.
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u64))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// A host allocation that is also addressable by the device.
///
/// Device stores to `device` become visible through `host` without a
/// blocking copy or synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub host: NonNull<u8>,
    pub device: DevicePtr,
    pub len: usize,
}

// SAFETY: a region is a plain address pair; whoever dereferences `host`
// (MappedBuffer) is responsible for ordering accesses.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Device-resident and host-mapped allocation, as supplied to the core.
///
/// Implementations must be usable from several threads; every stream of a
/// device context allocates through the same instance.
pub trait MemoryAllocator: Send + Sync {
    /// Allocates `len` bytes of device-resident memory.
    fn alloc_device(&self, len: usize) -> MemResult<DevicePtr>;

    fn free_device(&self, ptr: DevicePtr) -> MemResult<()>;

    /// Allocates `len` bytes of host memory mapped into the device address space.
    fn alloc_mapped(&self, len: usize) -> MemResult<MappedRegion>;

    fn free_mapped(&self, region: MappedRegion) -> MemResult<()>;

    /// Bytes currently charged against the allocator.
    fn allocated_bytes(&self) -> usize;

    /// Total bytes the allocator may hand out.
    fn capacity(&self) -> usize;
}
