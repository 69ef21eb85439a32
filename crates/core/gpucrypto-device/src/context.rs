//! Device context: the fixed stream pool of one accelerator session
//!
//! Stream ids follow the mode the context was initialized in:
//!
//! - `nstream == 0`: only id 0, the runtime's default stream
//! - `nstream > 0`: ids `1..=nstream`, each an explicitly created stream
//!
//! The pool is built once by [`DeviceContext::init`] and never grows or
//! shrinks until [`DeviceContext::teardown`]. Distinct streams can be driven
//! from different threads through [`DeviceContext::streams_mut`]; a single
//! stream must only be driven by one caller at a time.

use std::ops::Range;
use std::sync::Arc;

use gpucrypto_mem::{DevicePool, DevicePtr, MemoryAllocator, PinnedPool};
use serde::Serialize;

use crate::config::DeviceContextConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::runtime::{AcceleratorRuntime, StreamHandle};
use crate::stream::{StreamContext, StreamSetup, StreamState};

/// Snapshot of the pool's activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub nstream: usize,
    pub use_stream: bool,
    /// Streams with an operation not yet observed complete
    pub busy_streams: usize,
    /// `(stream id, completed operations)` for every stream in the pool
    pub completed_ops: Vec<(usize, u64)>,
}

/// Device context
pub struct DeviceContext {
    config: DeviceContextConfig,
    runtime: Arc<dyn AcceleratorRuntime>,
    allocator: Arc<dyn MemoryAllocator>,
    streams: Vec<StreamContext>,
    nstream: usize,
    initialized: bool,
}

impl DeviceContext {
    /// Creates an uninitialized context with the default configuration.
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>, allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            config: DeviceContextConfig::default(),
            runtime,
            allocator,
            streams: Vec::new(),
            nstream: 0,
            initialized: false,
        }
    }

    pub fn with_config(
        config: DeviceContextConfig,
        runtime: Arc<dyn AcceleratorRuntime>,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> DeviceResult<Self> {
        config.validate()?;
        let mut context = Self::new(runtime, allocator);
        context.config = config;
        Ok(context)
    }

    /// Builds the stream pool.
    ///
    /// Every stream gets `memory_size` bytes of device pool, a pinned pool,
    /// and `max_blocks` checkbits. On failure everything acquired so far is
    /// released and the context stays uninitialized.
    pub fn init(&mut self, memory_size: usize, nstream: usize) -> DeviceResult<()> {
        if self.initialized {
            return Err(DeviceError::AlreadyInitialized);
        }
        if nstream > self.config.max_stream {
            return Err(DeviceError::InvalidStreamCount {
                requested: nstream,
                max: self.config.max_stream,
            });
        }
        if memory_size == 0 {
            return Err(DeviceError::InvalidMemorySize(memory_size));
        }

        let setup = StreamSetup {
            explicit: nstream > 0,
            checkbit_capacity: self.config.max_blocks,
            memory_size,
            pinned_size: self.config.pinned_size_for(memory_size),
        };
        let ids = Self::id_range(nstream);
        let mut streams = Vec::with_capacity(self.config.max_stream + 1);

        for id in ids {
            match StreamContext::new(id, &self.runtime, &self.allocator, setup) {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    log::warn!(
                        "device context init failed at stream {}: {}; releasing {} streams",
                        id,
                        e,
                        streams.len()
                    );
                    return Err(e);
                }
            }
        }

        self.streams = streams;
        self.nstream = nstream;
        self.initialized = true;
        log::info!(
            "device context initialized: {} ({} B device + {} B pinned per stream, {} checkbits)",
            if nstream == 0 {
                "default stream only".to_string()
            } else {
                format!("{} streams", nstream)
            },
            setup.memory_size,
            setup.pinned_size,
            setup.checkbit_capacity
        );
        Ok(())
    }

    /// Releases every stream, buffer and pool. The context may be re-initialized.
    pub fn teardown(&mut self) -> DeviceResult<()> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        let released = self.streams.len();
        self.streams.clear();
        self.nstream = 0;
        self.initialized = false;
        log::info!("device context torn down, {} streams released", released);
        Ok(())
    }

    fn id_range(nstream: usize) -> Range<usize> {
        if nstream == 0 { 0..1 } else { 1..nstream + 1 }
    }

    fn slot(&self, stream_id: usize) -> DeviceResult<usize> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        let ids = Self::id_range(self.nstream);
        if ids.contains(&stream_id) {
            Ok(stream_id - ids.start)
        } else {
            Err(DeviceError::InvalidStreamId {
                id: stream_id,
                first: ids.start,
                last: ids.end - 1,
            })
        }
    }

    /// Checks whether the stream's current operation has finished.
    ///
    /// With `block`, polls until it has (see
    /// [`SyncPolicy`](crate::config::SyncPolicy)). Returns `true` when idle.
    pub fn sync(&mut self, stream_id: usize, block: bool) -> DeviceResult<bool> {
        let slot = self.slot(stream_id)?;
        self.streams[slot].sync(block, &self.config.sync)
    }

    /// Waits for the stream without blocking the executor thread.
    #[cfg(feature = "async")]
    pub async fn sync_async(&mut self, stream_id: usize) -> DeviceResult<bool> {
        let slot = self.slot(stream_id)?;
        self.streams[slot].sync_async(&self.config.sync).await
    }

    /// Records the operation just submitted to the stream.
    pub fn set_state(&mut self, stream_id: usize, state: StreamState) -> DeviceResult<()> {
        self.stream_mut(stream_id)?.set_state(state)
    }

    pub fn get_state(&self, stream_id: usize) -> DeviceResult<StreamState> {
        Ok(self.stream(stream_id)?.state())
    }

    /// Device address of the stream's checkbits, passed to the kernel.
    pub fn get_dev_checkbits(&self, stream_id: usize) -> DeviceResult<DevicePtr> {
        Ok(self.stream(stream_id)?.dev_checkbits())
    }

    /// Resets the first `num_blks` checkbits; call before each kernel launch
    /// with the launch's block count.
    pub fn clear_checkbits(&mut self, stream_id: usize, num_blks: usize) -> DeviceResult<()> {
        self.stream_mut(stream_id)?.clear_checkbits(num_blks)
    }

    pub fn get_stream(&self, stream_id: usize) -> DeviceResult<StreamHandle> {
        Ok(self.stream(stream_id)?.handle())
    }

    /// `true` if explicit streams are in use, `false` in default-stream mode.
    pub fn use_stream(&self) -> DeviceResult<bool> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        Ok(self.nstream > 0)
    }

    /// Microseconds taken by the last completed operation on the stream.
    pub fn get_elapsed_time(&self, stream_id: usize) -> DeviceResult<u64> {
        Ok(self.stream(stream_id)?.elapsed_usec())
    }

    pub fn stream(&self, stream_id: usize) -> DeviceResult<&StreamContext> {
        let slot = self.slot(stream_id)?;
        Ok(&self.streams[slot])
    }

    pub fn stream_mut(&mut self, stream_id: usize) -> DeviceResult<&mut StreamContext> {
        let slot = self.slot(stream_id)?;
        Ok(&mut self.streams[slot])
    }

    /// Every stream in the pool, mutably and disjointly.
    pub fn streams_mut(&mut self) -> std::slice::IterMut<'_, StreamContext> {
        self.streams.iter_mut()
    }

    /// Valid stream ids; empty before init.
    pub fn stream_ids(&self) -> Range<usize> {
        if self.initialized {
            Self::id_range(self.nstream)
        } else {
            0..0
        }
    }

    pub fn device_pool(&self, stream_id: usize) -> DeviceResult<&DevicePool> {
        Ok(self.stream(stream_id)?.device_pool())
    }

    pub fn device_pool_mut(&mut self, stream_id: usize) -> DeviceResult<&mut DevicePool> {
        Ok(self.stream_mut(stream_id)?.device_pool_mut())
    }

    pub fn pinned_pool(&self, stream_id: usize) -> DeviceResult<&PinnedPool> {
        Ok(self.stream(stream_id)?.pinned_pool())
    }

    pub fn pinned_pool_mut(&mut self, stream_id: usize) -> DeviceResult<&mut PinnedPool> {
        Ok(self.stream_mut(stream_id)?.pinned_pool_mut())
    }

    pub fn nstream(&self) -> usize {
        self.nstream
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &DeviceContextConfig {
        &self.config
    }

    pub fn stats(&self) -> DeviceResult<ContextStats> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        Ok(ContextStats {
            nstream: self.nstream,
            use_stream: self.nstream > 0,
            busy_streams: self.streams.iter().filter(|s| !s.is_finished()).count(),
            completed_ops: self
                .streams
                .iter()
                .map(|s| (s.id(), s.completed_ops()))
                .collect(),
        })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if self.initialized {
            log::debug!(
                "device context dropped without teardown, releasing {} streams",
                self.streams.len()
            );
        }
    }
}
