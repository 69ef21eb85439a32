//! Device context errors
//!
//! Contract violations are reported here instead of being left undefined:
//! every variant is returned before any stream state is touched.

use gpucrypto_mem::MemError;

use crate::config::ConfigError;
use crate::stream::StreamState;

/// Result alias for device context operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Requested stream count is above the configured maximum
    #[error("Invalid stream count {requested}: must be between 0 and {max}")]
    InvalidStreamCount { requested: usize, max: usize },

    #[error("Invalid memory size {0}: each stream needs a non-empty pool")]
    InvalidMemorySize(usize),

    /// Stream id is not one of the ids the context was initialized with
    #[error("Invalid stream id {id}: valid ids are {first}..={last}")]
    InvalidStreamId { id: usize, first: usize, last: usize },

    #[error("Block count {requested} exceeds checkbit capacity {capacity}")]
    BlockCountExceeded { requested: usize, capacity: usize },

    /// A new operation was recorded while another is still outstanding
    #[error("Stream {stream} is {current:?}; sync before recording {requested:?}")]
    StateConflict {
        stream: usize,
        current: StreamState,
        requested: StreamState,
    },

    #[error("Stream {0} has a kernel outstanding; its checkbits cannot be cleared")]
    KernelOutstanding(usize),

    #[error("Device context is not initialized")]
    NotInitialized,

    #[error("Device context is already initialized")]
    AlreadyInitialized,

    /// Blocking sync gave up; the stream keeps its state
    #[error("Stream {stream} did not complete within {waited_ms} ms")]
    SyncTimeout { stream: usize, waited_ms: u64 },

    #[error("Accelerator runtime error: {0}")]
    Runtime(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
