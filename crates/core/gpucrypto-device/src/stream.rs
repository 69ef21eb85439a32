//! Stream context: one accelerator stream, its checkbits, pools and timing
//!
//! A stream carries at most one outstanding operation. The caller submits
//! work through the runtime, records what it submitted with
//! [`StreamContext::set_state`], then calls [`StreamContext::sync`] before
//! recording the next submission.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::Backoff;
use gpucrypto_mem::{DevicePool, DevicePtr, MemoryAllocator, PinnedPool};
use serde::{Deserialize, Serialize};

use crate::checkbits::CheckbitBuffer;
use crate::config::SyncPolicy;
use crate::error::{DeviceError, DeviceResult};
use crate::runtime::{AcceleratorRuntime, StreamHandle};
use crate::timing::OpTimer;

/// Kind of operation outstanding on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamState {
    /// Idle; nothing outstanding
    #[default]
    Ready,
    /// Kernel launched; completion signalled through checkbits
    WaitKernel,
    /// Transfer submitted; completion signalled by a stream query
    WaitCopy,
}

/// Sizes a stream is built with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamSetup {
    pub explicit: bool,
    pub checkbit_capacity: usize,
    pub memory_size: usize,
    pub pinned_size: usize,
}

/// One entry of a device context's stream pool.
pub struct StreamContext {
    id: usize,
    handle: StreamHandle,
    owns_handle: bool,
    state: StreamState,
    finished: bool,
    checkbits: CheckbitBuffer,
    device_pool: DevicePool,
    pinned_pool: PinnedPool,
    timer: OpTimer,
    completed_ops: u64,
    runtime: Arc<dyn AcceleratorRuntime>,
}

impl StreamContext {
    /// Allocates buffers and pools, then creates the stream itself.
    ///
    /// Anything acquired before a failure is released by drop.
    pub(crate) fn new(
        id: usize,
        runtime: &Arc<dyn AcceleratorRuntime>,
        allocator: &Arc<dyn MemoryAllocator>,
        setup: StreamSetup,
    ) -> DeviceResult<Self> {
        let checkbits = CheckbitBuffer::new(allocator, setup.checkbit_capacity)?;
        let device_pool = DevicePool::new(allocator, setup.memory_size)?;
        let pinned_pool = PinnedPool::new(allocator, setup.pinned_size)?;

        let handle = if setup.explicit {
            runtime.create_stream()?
        } else {
            runtime.default_stream()
        };
        log::debug!(
            "stream {} ready on {:?} ({} checkbits, {} B device pool, {} B pinned pool)",
            id,
            handle,
            setup.checkbit_capacity,
            setup.memory_size,
            setup.pinned_size
        );

        Ok(Self {
            id,
            handle,
            owns_handle: setup.explicit,
            state: StreamState::Ready,
            finished: true,
            checkbits,
            device_pool,
            pinned_pool,
            timer: OpTimer::default(),
            completed_ops: 0,
            runtime: Arc::clone(runtime),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runtime stream to submit copies and launches to.
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the most recent submission has been observed complete.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records the kind of operation just submitted.
    ///
    /// Fails with [`DeviceError::StateConflict`] while a previous operation is
    /// still outstanding. Recording `Ready` on an idle stream is a no-op.
    pub fn set_state(&mut self, state: StreamState) -> DeviceResult<()> {
        if self.state != StreamState::Ready {
            return Err(DeviceError::StateConflict {
                stream: self.id,
                current: self.state,
                requested: state,
            });
        }
        if state != StreamState::Ready {
            self.begin_operation();
            self.state = state;
            log::trace!("stream {} -> {:?}", self.id, state);
        }
        Ok(())
    }

    /// Zeroes the first `num_blks` checkbits ahead of a kernel launch.
    pub fn clear_checkbits(&mut self, num_blks: usize) -> DeviceResult<()> {
        if self.state == StreamState::WaitKernel {
            return Err(DeviceError::KernelOutstanding(self.id));
        }
        self.checkbits.clear(num_blks)?;
        self.begin_operation();
        Ok(())
    }

    /// Device address of the checkbits, for the kernel to mark blocks done.
    pub fn dev_checkbits(&self) -> DevicePtr {
        self.checkbits.device_ptr()
    }

    pub fn checkbits(&self) -> &CheckbitBuffer {
        &self.checkbits
    }

    /// Non-blocking completion check; never changes state.
    pub fn poll(&self) -> DeviceResult<bool> {
        match self.state {
            StreamState::WaitCopy => self.runtime.query_stream(self.handle),
            StreamState::Ready | StreamState::WaitKernel => Ok(self.checkbits.is_complete()),
        }
    }

    /// Reports whether the stream is idle, waiting for it first if `block`.
    ///
    /// On completion the elapsed time is recorded and the stream returns to
    /// `Ready`. Checkbits are left as the device wrote them. A blocking wait
    /// that exceeds `policy`'s timeout returns [`DeviceError::SyncTimeout`]
    /// with the stream untouched.
    pub fn sync(&mut self, block: bool, policy: &SyncPolicy) -> DeviceResult<bool> {
        if !self.poll()? {
            if !block {
                return Ok(false);
            }
            self.wait(policy)?;
        }
        self.complete();
        Ok(true)
    }

    fn wait(&self, policy: &SyncPolicy) -> DeviceResult<()> {
        let backoff = Backoff::new();
        let started = Instant::now();
        let timeout = policy.timeout();
        let interval = policy.poll_interval();

        loop {
            if self.poll()? {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    log::warn!(
                        "stream {} still {:?} after {:?} ({} of {} blocks done)",
                        self.id,
                        self.state,
                        timeout,
                        self.checkbits.completed_blocks(),
                        self.checkbits.num_blks()
                    );
                    return Err(DeviceError::SyncTimeout {
                        stream: self.id,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            if !backoff.is_completed() {
                backoff.snooze();
            } else if interval.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(interval);
            }
        }
    }

    /// Async form of a blocking [`sync`](Self::sync): sleeps on the tokio
    /// timer between polls instead of parking the thread.
    #[cfg(feature = "async")]
    pub async fn sync_async(&mut self, policy: &SyncPolicy) -> DeviceResult<bool> {
        let started = Instant::now();
        let interval = policy.poll_interval().max(std::time::Duration::from_micros(1));

        while !self.poll()? {
            if let Some(timeout) = policy.timeout() {
                if started.elapsed() >= timeout {
                    return Err(DeviceError::SyncTimeout {
                        stream: self.id,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            tokio::time::sleep(interval).await;
        }
        self.complete();
        Ok(true)
    }

    fn begin_operation(&mut self) {
        if self.finished {
            self.finished = false;
            self.timer.start();
        }
    }

    fn complete(&mut self) {
        if !self.finished {
            let elapsed = self.timer.stop();
            self.finished = true;
            self.completed_ops += 1;
            log::debug!(
                "stream {} completed {:?} in {} us",
                self.id,
                self.state,
                elapsed
            );
        }
        self.state = StreamState::Ready;
    }

    /// Duration of the last completed operation, in microseconds.
    ///
    /// Only meaningful while the stream is `Ready`.
    pub fn elapsed_usec(&self) -> u64 {
        self.timer.elapsed_usec()
    }

    pub fn begin_usec(&self) -> u64 {
        self.timer.begin_usec()
    }

    pub fn end_usec(&self) -> u64 {
        self.timer.end_usec()
    }

    pub fn completed_ops(&self) -> u64 {
        self.completed_ops
    }

    pub fn device_pool(&self) -> &DevicePool {
        &self.device_pool
    }

    pub fn device_pool_mut(&mut self) -> &mut DevicePool {
        &mut self.device_pool
    }

    pub fn pinned_pool(&self) -> &PinnedPool {
        &self.pinned_pool
    }

    pub fn pinned_pool_mut(&mut self) -> &mut PinnedPool {
        &mut self.pinned_pool
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("finished", &self.finished)
            .field("num_blks", &self.checkbits.num_blks())
            .field("elapsed_usec", &self.timer.elapsed_usec())
            .finish()
    }
}

impl Drop for StreamContext {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!(
                "stream {} released with a {:?} operation outstanding",
                self.id,
                self.state
            );
        }
        if self.owns_handle {
            if let Err(e) = self.runtime.destroy_stream(self.handle) {
                log::warn!("failed to destroy stream {:?}: {}", self.handle, e);
            }
        }
    }
}
