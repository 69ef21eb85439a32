//! # gpucrypto-mem
//!
//! Memory collaborator for the offload engine's scheduling core.
//!
//! - [`MemoryAllocator`]: the allocate/free/map capability the core consumes
//! - [`DeviceBuffer`] / [`MappedBuffer`]: RAII ownership of allocations
//! - [`HostAllocator`]: host-backed allocator that emulates a device with
//!   unified addressing
//! - [`DevicePool`] / [`PinnedPool`]: per-stream bump pools for working memory

pub mod allocator;
pub mod buffer;
pub mod error;
pub mod host;
pub mod pool;

pub use allocator::{DevicePtr, MappedRegion, MemoryAllocator};
pub use buffer::{DeviceBuffer, MappedBuffer};
pub use error::{MemError, MemResult};
pub use host::HostAllocator;
pub use pool::{DevicePool, POOL_ALIGNMENT, PinnedPool, PinnedRegion};
