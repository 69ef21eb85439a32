//! In-process accelerator runtime
//!
//! Hands out distinct stream handles and tracks outstanding transfers per
//! stream so that copy completion can be driven by hand. Kernel completion is
//! modelled separately, by storing checkbits through the memory allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{DeviceError, DeviceResult};
use crate::runtime::{AcceleratorRuntime, StreamHandle};

/// Simulated accelerator runtime
#[derive(Debug)]
pub struct SimulatedRuntime {
    next_handle: AtomicU64,
    created: AtomicUsize,
    /// 1-based index of the creation that should fail
    fail_create_at: Mutex<Option<usize>>,
    /// Live streams and their outstanding copy count
    pending_copies: Mutex<HashMap<StreamHandle, usize>>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        let mut pending = HashMap::new();
        pending.insert(StreamHandle::DEFAULT, 0);
        Self {
            next_handle: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            fail_create_at: Mutex::new(None),
            pending_copies: Mutex::new(pending),
        }
    }

    /// Makes the `nth` stream creation from now on fail (1-based).
    pub fn fail_stream_creation_at(&self, nth: usize) {
        let already = self.created.load(Ordering::SeqCst);
        *self.fail_create_at.lock() = Some(already + nth);
    }

    /// Explicit streams currently alive.
    pub fn live_streams(&self) -> usize {
        self.pending_copies
            .lock()
            .keys()
            .filter(|handle| !handle.is_default())
            .count()
    }

    pub fn is_live(&self, handle: StreamHandle) -> bool {
        self.pending_copies.lock().contains_key(&handle)
    }

    /// Records an asynchronous transfer submitted to `handle`.
    pub fn begin_copy(&self, handle: StreamHandle) -> DeviceResult<()> {
        let mut pending = self.pending_copies.lock();
        let count = pending
            .get_mut(&handle)
            .ok_or_else(|| DeviceError::Runtime(format!("unknown stream {:?}", handle)))?;
        *count += 1;
        Ok(())
    }

    /// Marks the oldest outstanding transfer on `handle` as finished.
    pub fn complete_copy(&self, handle: StreamHandle) -> DeviceResult<()> {
        let mut pending = self.pending_copies.lock();
        let count = pending
            .get_mut(&handle)
            .ok_or_else(|| DeviceError::Runtime(format!("unknown stream {:?}", handle)))?;
        if *count == 0 {
            return Err(DeviceError::Runtime(format!(
                "no transfer outstanding on {:?}",
                handle
            )));
        }
        *count -= 1;
        Ok(())
    }

    pub fn pending_copies(&self, handle: StreamHandle) -> usize {
        self.pending_copies.lock().get(&handle).copied().unwrap_or(0)
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorRuntime for SimulatedRuntime {
    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        let nth = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_create_at.lock() == Some(nth) {
            log::debug!("simulated stream creation #{} failing on request", nth);
            return Err(DeviceError::Runtime(format!(
                "stream creation #{} failed",
                nth
            )));
        }

        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.pending_copies.lock().insert(handle, 0);
        Ok(handle)
    }

    fn destroy_stream(&self, handle: StreamHandle) -> DeviceResult<()> {
        if handle.is_default() {
            return Err(DeviceError::Runtime(
                "the default stream cannot be destroyed".to_string(),
            ));
        }
        self.pending_copies
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| DeviceError::Runtime(format!("unknown stream {:?}", handle)))
    }

    fn query_stream(&self, handle: StreamHandle) -> DeviceResult<bool> {
        self.pending_copies
            .lock()
            .get(&handle)
            .map(|&count| count == 0)
            .ok_or_else(|| DeviceError::Runtime(format!("unknown stream {:?}", handle)))
    }
}
