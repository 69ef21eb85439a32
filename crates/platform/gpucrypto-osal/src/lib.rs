//! gpucrypto-osal: 操作系统抽象层
//!
//! Page-granular anonymous mappings and the memory barriers used when host
//! code and (simulated) device code share the same bytes.

use std::sync::atomic::{Ordering, fence};

// ============================================================================
// 内存屏障
// ============================================================================

/// Orders subsequent loads after a poll of device-written memory.
pub fn barrier_acquire() {
    fence(Ordering::Acquire);
}

/// Publishes preceding stores before a device-visible flag write.
pub fn barrier_release() {
    fence(Ordering::Release);
}

pub fn barrier_full() {
    fence(Ordering::SeqCst);
}

// ============================================================================
// 页大小
// ============================================================================

/// Host page size in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
        4096
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Rounds `size` up to a whole number of pages, or `None` if that overflows.
pub fn checked_round_to_pages(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(page_size())
}

// ============================================================================
// 内存权限
// ============================================================================

/// 内存保护标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProtection {
    pub read: bool,
    pub write: bool,
}

impl MemoryProtection {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    #[cfg(unix)]
    fn to_prot_flags(self) -> libc::c_int {
        let mut flags = libc::PROT_NONE;
        if self.read {
            flags |= libc::PROT_READ;
        }
        if self.write {
            flags |= libc::PROT_WRITE;
        }
        flags
    }
}

// ============================================================================
// 内存映射抽象
// ============================================================================

/// 内存映射结果
pub type MemoryResult<T> = Result<T, MemoryError>;

/// 内存错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory allocation of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("Invalid memory size: {0}")]
    InvalidSize(usize),
}

/// Zero-filled, page-aligned anonymous mapping owned by the host process.
///
/// The mapping is released when the value is dropped.
#[derive(Debug)]
pub struct MappedMemory {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is exclusively owned; concurrent access goes through
// raw pointers whose users order their own loads and stores.
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// 分配匿名内存映射
    ///
    /// `size` is rounded up to whole pages. Fresh mappings read as zero.
    pub fn allocate(size: usize, prot: MemoryProtection) -> MemoryResult<Self> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let size = checked_round_to_pages(size).ok_or(MemoryError::InvalidSize(size))?;

        #[cfg(unix)]
        {
            Self::allocate_unix(size, prot)
        }
        #[cfg(not(unix))]
        {
            Self::allocate_fallback(size, prot)
        }
    }

    #[cfg(unix)]
    fn allocate_unix(size: usize, prot: MemoryProtection) -> MemoryResult<Self> {
        // SAFETY: anonymous private mapping with no fixed address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot.to_prot_flags(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            log::warn!("mmap of {} bytes failed", size);
            return Err(MemoryError::AllocationFailed(size));
        }

        log::trace!("mapped {} bytes at {:p}", size, ptr);
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[cfg(not(unix))]
    fn allocate_fallback(size: usize, _prot: MemoryProtection) -> MemoryResult<Self> {
        let layout = std::alloc::Layout::from_size_align(size, page_size())
            .map_err(|_| MemoryError::InvalidSize(size))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::AllocationFailed(size));
        }
        Ok(Self { ptr, size })
    }

    /// 获取内存指针
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Raw mutable pointer to the start of the mapping.
    ///
    /// Takes `&self`: the mapping is shared between host code and device
    /// writers, so exclusivity is not expressible through borrows.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Address of the first byte, as an integer.
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    /// 获取内存大小
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr..addr + len` lies inside this mapping.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.addr();
        addr >= start && addr.saturating_add(len as u64) <= start + self.size as u64
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: ptr/size came from a successful mmap in allocate_unix.
            let ret = unsafe { libc::munmap(self.ptr as *mut _, self.size) };
            if ret != 0 {
                log::warn!("munmap of {:p} ({} bytes) failed", self.ptr, self.size);
            }
        }

        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, page_size()) {
                // SAFETY: ptr was allocated with this layout in allocate_fallback.
                unsafe { std::alloc::dealloc(self.ptr, layout) };
            }
        }
    }
}
