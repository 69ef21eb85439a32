//! Memory collaborator errors

use gpucrypto_osal::MemoryError;

/// Result alias for allocation and pool operations
pub type MemResult<T> = Result<T, MemError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    /// The allocator's capacity budget cannot cover the request
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Zero-sized allocation")]
    ZeroSized,

    /// Pointer does not belong to a live allocation of the expected kind
    #[error("Invalid device pointer {0:#x}")]
    InvalidPointer(u64),

    #[error("Pool exhausted: requested {requested} bytes, {remaining} remaining")]
    PoolExhausted { requested: usize, remaining: usize },

    #[error("Region out of bounds: offset {offset} + length {len} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("OS mapping failed: {0}")]
    Os(#[from] MemoryError),
}
