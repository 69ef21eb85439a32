//! Per-operation timing

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock microseconds since the Unix epoch.
pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Brackets one outstanding stream operation.
///
/// Timestamps are wall-clock; the elapsed value is measured on the monotonic
/// clock and rounded up, so a finished operation never reports zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpTimer {
    begin_usec: u64,
    end_usec: u64,
    elapsed_usec: u64,
    started: Option<Instant>,
}

impl OpTimer {
    pub fn start(&mut self) {
        self.begin_usec = now_usec();
        self.started = Some(Instant::now());
    }

    /// Stops the timer and returns the elapsed microseconds. No-op if not running.
    pub fn stop(&mut self) -> u64 {
        if let Some(started) = self.started.take() {
            self.end_usec = now_usec().max(self.begin_usec);
            let nanos = started.elapsed().as_nanos();
            self.elapsed_usec = (nanos.div_ceil(1000) as u64).max(1);
        }
        self.elapsed_usec
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn begin_usec(&self) -> u64 {
        self.begin_usec
    }

    pub fn end_usec(&self) -> u64 {
        self.end_usec
    }

    /// Duration of the last completed operation; stale while running.
    pub fn elapsed_usec(&self) -> u64 {
        self.elapsed_usec
    }
}
