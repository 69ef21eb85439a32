//! Accelerator runtime seam
//!
//! The core only needs to create and destroy streams and to ask, without
//! blocking, whether a stream has drained. Copies and kernel launches are
//! issued by the caller against the runtime directly.

use std::fmt;

use crate::error::DeviceResult;

/// Opaque accelerator stream handle. Handle 0 is the default stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    pub const DEFAULT: Self = Self(0);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "StreamHandle(default)")
        } else {
            write!(f, "StreamHandle({:#x})", self.0)
        }
    }
}

/// Stream management capability of an accelerator runtime.
///
/// There is no stream-synchronize here: waiting on one stream
/// must never hold up submission to its siblings.
pub trait AcceleratorRuntime: Send + Sync {
    /// Creates an explicit, non-default stream.
    fn create_stream(&self) -> DeviceResult<StreamHandle>;

    fn destroy_stream(&self, handle: StreamHandle) -> DeviceResult<()>;

    /// Non-blocking: `true` once all work submitted to `handle` has finished.
    fn query_stream(&self, handle: StreamHandle) -> DeviceResult<bool>;

    /// The runtime's implicit stream.
    fn default_stream(&self) -> StreamHandle {
        StreamHandle::DEFAULT
    }
}
