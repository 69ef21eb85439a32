//! # gpucrypto-device
//!
//! Device-side scheduling core of the GPU crypto offload engine.
//!
//! A [`DeviceContext`] owns a fixed pool of [`StreamContext`]s. Callers submit
//! copies and kernel launches to a stream's runtime handle themselves, record
//! what they submitted, and then poll for completion. Kernel completion is
//! read from per-block checkbits in host-mapped memory, so waiting on one
//! stream never stalls submission to another.
//!
//! ```rust,ignore
//! let mut ctx = DeviceContext::new(runtime, allocator);
//! ctx.init(1 << 20, 4)?;
//!
//! ctx.clear_checkbits(2, blocks)?;
//! launch_kernel(ctx.get_stream(2)?, ctx.get_dev_checkbits(2)?, blocks);
//! ctx.set_state(2, StreamState::WaitKernel)?;
//!
//! while !ctx.sync(2, false)? {
//!     // drive other streams
//! }
//! let usec = ctx.get_elapsed_time(2)?;
//! ```

pub mod checkbits;
pub mod config;
pub mod context;
pub mod error;
pub mod runtime;
pub mod sim;
pub mod stream;
pub mod timing;

pub use checkbits::CheckbitBuffer;
pub use config::{ConfigError, DeviceContextConfig, SyncPolicy};
pub use context::{ContextStats, DeviceContext};
pub use error::{DeviceError, DeviceResult};
pub use runtime::{AcceleratorRuntime, StreamHandle};
pub use sim::SimulatedRuntime;
pub use stream::{StreamContext, StreamState};

/// Default stream pool bound; stream ids run up to this value.
pub const MAX_STREAM: usize = 16;
/// Default checkbit capacity per stream, i.e. blocks per kernel launch.
pub const MAX_BLOCKS: usize = 8192;
