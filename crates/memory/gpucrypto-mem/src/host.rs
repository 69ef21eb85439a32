//! Host-backed allocator
//!
//! Emulates a device with unified virtual addressing: every allocation is an
//! anonymous page mapping and its device address equals its host address.
//! [`HostAllocator::device_store`] stands in for device code writing through
//! a device pointer.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};

use gpucrypto_osal::{
    MappedMemory, MemoryProtection, barrier_acquire, barrier_release, checked_round_to_pages,
};
use parking_lot::Mutex;

use crate::allocator::{DevicePtr, MappedRegion, MemoryAllocator};
use crate::error::{MemError, MemResult};

/// 1 GiB
pub const DEFAULT_HOST_CAPACITY: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Device,
    Mapped,
}

#[derive(Debug)]
struct Region {
    memory: MappedMemory,
    kind: RegionKind,
}

#[derive(Debug, Default)]
struct Regions {
    allocated: usize,
    by_addr: BTreeMap<u64, Region>,
}

impl Regions {
    fn containing(&self, addr: u64) -> Option<&Region> {
        self.by_addr
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.memory.contains(addr, 1))
    }
}

/// Host memory allocator with a fixed capacity budget.
#[derive(Debug)]
pub struct HostAllocator {
    capacity: usize,
    regions: Mutex<Regions>,
}

impl HostAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            regions: Mutex::new(Regions::default()),
        }
    }

    /// Number of live allocations of either kind.
    pub fn live_allocations(&self) -> usize {
        self.regions.lock().by_addr.len()
    }

    /// Stores one byte at a device address, as a kernel would.
    ///
    /// The address must lie inside a live allocation.
    pub fn device_store(&self, ptr: DevicePtr, value: u8) -> MemResult<()> {
        let regions = self.regions.lock();
        let region = regions
            .containing(ptr.addr())
            .ok_or(MemError::InvalidPointer(ptr.addr()))?;
        let offset = (ptr.addr() - region.memory.addr()) as usize;
        barrier_release();
        // SAFETY: containing() checked the byte lies inside the mapping, and
        // the mapping stays alive while the lock is held.
        unsafe { ptr::write_volatile(region.memory.as_mut_ptr().add(offset), value) };
        Ok(())
    }

    /// Loads one byte from a device address.
    pub fn device_load(&self, ptr: DevicePtr) -> MemResult<u8> {
        let regions = self.regions.lock();
        let region = regions
            .containing(ptr.addr())
            .ok_or(MemError::InvalidPointer(ptr.addr()))?;
        let offset = (ptr.addr() - region.memory.addr()) as usize;
        // SAFETY: as in device_store.
        let value = unsafe { ptr::read_volatile(region.memory.as_ptr().add(offset)) };
        barrier_acquire();
        Ok(value)
    }

    /// Charges a page-rounded `len` against the budget.
    fn reserve(&self, len: usize) -> MemResult<usize> {
        let mut regions = self.regions.lock();
        let available = self.capacity.saturating_sub(regions.allocated);
        match checked_round_to_pages(len) {
            Some(charged) if charged <= available => {
                regions.allocated += charged;
                Ok(charged)
            }
            charged => {
                log::debug!(
                    "host allocator refused {} bytes ({} of {} in use)",
                    len,
                    regions.allocated,
                    self.capacity
                );
                Err(MemError::OutOfMemory {
                    requested: charged.unwrap_or(len),
                    available,
                })
            }
        }
    }

    fn map(&self, len: usize, kind: RegionKind) -> MemResult<(u64, NonNull<u8>)> {
        if len == 0 {
            return Err(MemError::ZeroSized);
        }
        let charged = self.reserve(len)?;

        // The lock is not held across mmap; the reservation keeps the budget.
        let mapped = MappedMemory::allocate(len, MemoryProtection::READ_WRITE)
            .map_err(MemError::from)
            .and_then(|memory| {
                NonNull::new(memory.as_mut_ptr())
                    .map(|host| (memory, host))
                    .ok_or(MemError::InvalidPointer(0))
            });

        let mut regions = self.regions.lock();
        match mapped {
            Ok((memory, host)) => {
                let addr = memory.addr();
                regions.by_addr.insert(addr, Region { memory, kind });
                log::trace!("host allocator mapped {:?} region of {} bytes at {:#x}", kind, len, addr);
                Ok((addr, host))
            }
            Err(e) => {
                regions.allocated -= charged;
                Err(e)
            }
        }
    }

    fn unmap(&self, addr: u64, kind: RegionKind) -> MemResult<()> {
        let mut regions = self.regions.lock();
        match regions.by_addr.get(&addr) {
            Some(region) if region.kind == kind => {}
            _ => return Err(MemError::InvalidPointer(addr)),
        }
        if let Some(region) = regions.by_addr.remove(&addr) {
            regions.allocated -= region.memory.size();
        }
        Ok(())
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_CAPACITY)
    }
}

impl MemoryAllocator for HostAllocator {
    fn alloc_device(&self, len: usize) -> MemResult<DevicePtr> {
        let (addr, _) = self.map(len, RegionKind::Device)?;
        Ok(DevicePtr(addr))
    }

    fn free_device(&self, ptr: DevicePtr) -> MemResult<()> {
        self.unmap(ptr.addr(), RegionKind::Device)
    }

    fn alloc_mapped(&self, len: usize) -> MemResult<MappedRegion> {
        let (addr, host) = self.map(len, RegionKind::Mapped)?;
        Ok(MappedRegion {
            host,
            device: DevicePtr(addr),
            len,
        })
    }

    fn free_mapped(&self, region: MappedRegion) -> MemResult<()> {
        self.unmap(region.device.addr(), RegionKind::Mapped)
    }

    fn allocated_bytes(&self) -> usize {
        self.regions.lock().allocated
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
