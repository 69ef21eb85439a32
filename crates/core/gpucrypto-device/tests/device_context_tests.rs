//! Device context integration tests
//!
//! Kernel completion is simulated by storing checkbits through the host
//! allocator's device view, the way a kernel's final store would land.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpucrypto_device::{
    DeviceContext, DeviceContextConfig, DeviceError, MAX_STREAM, SimulatedRuntime, StreamState,
    SyncPolicy,
};
use gpucrypto_mem::{DevicePtr, HostAllocator, MemoryAllocator};

const MB: usize = 1 << 20;

struct Harness {
    host: Arc<HostAllocator>,
    sim: Arc<SimulatedRuntime>,
    ctx: DeviceContext,
}

fn harness() -> Harness {
    harness_with(DeviceContextConfig::default(), 512 * MB)
}

fn harness_with(config: DeviceContextConfig, capacity: usize) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let host = Arc::new(HostAllocator::new(capacity));
    let sim = Arc::new(SimulatedRuntime::new());
    let ctx = DeviceContext::with_config(config, sim.clone(), host.clone()).unwrap();
    Harness { host, sim, ctx }
}

fn complete_blocks(host: &HostAllocator, checkbits: DevicePtr, blocks: std::ops::Range<usize>) {
    for block in blocks {
        host.device_store(checkbits.offset(block), 1).unwrap();
    }
}

#[test]
fn test_four_stream_scenario() {
    let mut h = harness();
    h.ctx.init(MB, 4).unwrap();

    let s2 = h.ctx.get_stream(2).unwrap();
    let s3 = h.ctx.get_stream(3).unwrap();
    assert_ne!(s2, s3);

    h.ctx.clear_checkbits(2, 512).unwrap();
    assert!(!h.ctx.sync(2, false).unwrap());
    assert_eq!(h.ctx.get_state(3).unwrap(), StreamState::Ready);

    let bits = h.ctx.get_dev_checkbits(2).unwrap();
    complete_blocks(&h.host, bits, 0..511);
    assert!(!h.ctx.sync(2, false).unwrap());
    assert_eq!(h.ctx.get_state(3).unwrap(), StreamState::Ready);

    complete_blocks(&h.host, bits, 511..512);
    assert!(h.ctx.sync(2, false).unwrap());
    assert!(h.ctx.get_elapsed_time(2).unwrap() > 0);
    assert_eq!(h.ctx.get_state(2).unwrap(), StreamState::Ready);
    assert_eq!(h.ctx.get_state(3).unwrap(), StreamState::Ready);
}

#[test]
fn test_kernel_round_trip_blocking() {
    let mut h = harness();
    h.ctx.init(MB, 2).unwrap();

    h.ctx.clear_checkbits(1, 64).unwrap();
    h.ctx.set_state(1, StreamState::WaitKernel).unwrap();
    let bits = h.ctx.get_dev_checkbits(1).unwrap();

    let device = {
        let host = Arc::clone(&h.host);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            complete_blocks(&host, bits, 0..64);
        })
    };

    assert!(h.ctx.sync(1, true).unwrap());
    device.join().unwrap();

    assert_eq!(h.ctx.get_state(1).unwrap(), StreamState::Ready);
    assert!(h.ctx.get_elapsed_time(1).unwrap() >= 5_000);
    let stream = h.ctx.stream(1).unwrap();
    assert!(stream.end_usec() >= stream.begin_usec());
    assert_eq!(stream.checkbits().completed_blocks(), 64);
}

#[test]
fn test_copy_kernel_copy_pipeline() {
    let mut h = harness();
    h.ctx.init(MB, 1).unwrap();
    let handle = h.ctx.get_stream(1).unwrap();

    // copy in
    h.sim.begin_copy(handle).unwrap();
    h.ctx.set_state(1, StreamState::WaitCopy).unwrap();
    assert!(!h.ctx.sync(1, false).unwrap());
    h.sim.complete_copy(handle).unwrap();
    assert!(h.ctx.sync(1, false).unwrap());

    // kernel
    h.ctx.clear_checkbits(1, 16).unwrap();
    h.ctx.set_state(1, StreamState::WaitKernel).unwrap();
    assert!(!h.ctx.sync(1, false).unwrap());
    complete_blocks(&h.host, h.ctx.get_dev_checkbits(1).unwrap(), 0..16);
    assert!(h.ctx.sync(1, false).unwrap());

    // copy out; stale checkbits from the kernel must not count as completion
    h.sim.begin_copy(handle).unwrap();
    h.ctx.set_state(1, StreamState::WaitCopy).unwrap();
    assert!(!h.ctx.sync(1, false).unwrap());
    h.sim.complete_copy(handle).unwrap();
    assert!(h.ctx.sync(1, true).unwrap());

    assert_eq!(h.ctx.stream(1).unwrap().completed_ops(), 3);
}

#[test]
fn test_set_state_requires_intervening_sync() {
    let mut h = harness();
    h.ctx.init(MB, 1).unwrap();

    h.ctx.clear_checkbits(1, 4).unwrap();
    h.ctx.set_state(1, StreamState::WaitKernel).unwrap();
    let err = h.ctx.set_state(1, StreamState::WaitCopy).unwrap_err();
    assert_eq!(
        err,
        DeviceError::StateConflict {
            stream: 1,
            current: StreamState::WaitKernel,
            requested: StreamState::WaitCopy,
        }
    );
    assert_eq!(h.ctx.get_state(1).unwrap(), StreamState::WaitKernel);

    complete_blocks(&h.host, h.ctx.get_dev_checkbits(1).unwrap(), 0..4);
    assert!(h.ctx.sync(1, false).unwrap());
    assert!(h.ctx.set_state(1, StreamState::WaitCopy).is_ok());
}

#[test]
fn test_checkbit_capacity_boundary() {
    let mut config = DeviceContextConfig::default();
    config.max_blocks = 1024;
    let mut h = harness_with(config, 512 * MB);
    h.ctx.init(MB, 1).unwrap();

    assert!(h.ctx.clear_checkbits(1, 1024).is_ok());
    assert!(h.ctx.sync(1, false).is_ok());
    assert_eq!(
        h.ctx.clear_checkbits(1, 1025),
        Err(DeviceError::BlockCountExceeded {
            requested: 1025,
            capacity: 1024
        })
    );
    assert_eq!(h.ctx.stream(1).unwrap().checkbits().num_blks(), 1024);
}

#[test]
fn test_streams_driven_independently_across_threads() {
    let mut h = harness();
    h.ctx.init(MB, 2).unwrap();
    let policy = SyncPolicy::default();
    let host = &h.host;

    let mut streams: Vec<_> = h.ctx.streams_mut().collect();
    let (busy, rest) = streams.split_at_mut(1);
    let busy = &mut *busy[0];
    let quick = &mut *rest[0];

    busy.clear_checkbits(32).unwrap();
    busy.set_state(StreamState::WaitKernel).unwrap();
    let busy_begin = busy.begin_usec();

    thread::scope(|scope| {
        scope.spawn(|| {
            quick.clear_checkbits(8).unwrap();
            quick.set_state(StreamState::WaitKernel).unwrap();
            complete_blocks(host, quick.dev_checkbits(), 0..8);
            assert!(quick.sync(true, &policy).unwrap());
        });
        scope.spawn(|| {
            assert!(!busy.sync(false, &policy).unwrap());
        });
    });

    drop(streams);
    assert_eq!(h.ctx.get_state(1).unwrap(), StreamState::WaitKernel);
    assert!(!h.ctx.stream(1).unwrap().is_finished());
    assert_eq!(h.ctx.stream(1).unwrap().begin_usec(), busy_begin);
    assert_eq!(h.ctx.get_state(2).unwrap(), StreamState::Ready);
    assert!(h.ctx.get_elapsed_time(2).unwrap() > 0);
}

#[test]
fn test_default_stream_mode_cycle() {
    let mut h = harness();
    h.ctx.init(MB, 0).unwrap();
    assert!(!h.ctx.use_stream().unwrap());
    assert_eq!(h.sim.live_streams(), 0);

    h.ctx.clear_checkbits(0, 3).unwrap();
    h.ctx.set_state(0, StreamState::WaitKernel).unwrap();
    complete_blocks(&h.host, h.ctx.get_dev_checkbits(0).unwrap(), 0..3);
    assert!(h.ctx.sync(0, true).unwrap());
    assert_eq!(h.ctx.get_state(0).unwrap(), StreamState::Ready);
}

#[test]
fn test_init_unwinds_on_allocation_failure() {
    // Room for one stream's pools and checkbits, not two.
    let mut h = harness_with(DeviceContextConfig::default(), 3 * MB);
    let err = h.ctx.init(MB, 2).unwrap_err();
    assert!(matches!(err, DeviceError::Memory(_)));
    assert!(!h.ctx.is_initialized());
    assert_eq!(h.host.allocated_bytes(), 0);
    assert_eq!(h.host.live_allocations(), 0);
    assert_eq!(h.sim.live_streams(), 0);

    // A smaller request then succeeds.
    h.ctx.init(MB, 1).unwrap();
    assert_eq!(h.sim.live_streams(), 1);
}

#[test]
fn test_init_rejects_unmappable_memory_size() {
    let mut h = harness_with(DeviceContextConfig::default(), 1 << 30);
    let err = h.ctx.init(usize::MAX, 1).unwrap_err();
    assert!(matches!(err, DeviceError::Memory(_)));
    assert!(!h.ctx.is_initialized());
    assert_eq!(h.host.allocated_bytes(), 0);
    assert_eq!(h.host.live_allocations(), 0);
    assert_eq!(h.sim.live_streams(), 0);

    h.ctx.init(MB, 1).unwrap();
}

#[test]
fn test_init_rejects_unmappable_pinned_size() {
    let mut config = DeviceContextConfig::default();
    config.pinned_memory_size_per_stream = Some(usize::MAX);
    let mut h = harness_with(config, 1 << 30);
    let err = h.ctx.init(MB, 2).unwrap_err();
    assert!(matches!(err, DeviceError::Memory(_)));
    assert_eq!(h.host.allocated_bytes(), 0);
    assert_eq!(h.sim.live_streams(), 0);
}

#[test]
fn test_init_unwinds_on_stream_creation_failure() {
    let mut h = harness();
    h.sim.fail_stream_creation_at(3);
    let err = h.ctx.init(MB, 4).unwrap_err();
    assert!(matches!(err, DeviceError::Runtime(_)));
    assert_eq!(h.sim.live_streams(), 0);
    assert_eq!(h.host.allocated_bytes(), 0);
}

#[test]
fn test_max_stream_pool() {
    let mut h = harness();
    h.ctx.init(64 << 10, MAX_STREAM).unwrap();
    let mut handles: Vec<_> = h
        .ctx
        .stream_ids()
        .map(|id| h.ctx.get_stream(id).unwrap())
        .collect();
    handles.sort_by_key(|handle| handle.raw());
    handles.dedup();
    assert_eq!(handles.len(), MAX_STREAM);
    assert_eq!(h.sim.live_streams(), MAX_STREAM);
}

#[test]
fn test_per_stream_pools() {
    let mut config = DeviceContextConfig::default();
    config.pinned_memory_size_per_stream = Some(64 << 10);
    let mut h = harness_with(config, 512 * MB);
    h.ctx.init(MB, 2).unwrap();

    assert_eq!(h.ctx.device_pool(1).unwrap().capacity(), MB);
    assert_eq!(h.ctx.pinned_pool(2).unwrap().capacity(), 64 << 10);

    let input = h.ctx.device_pool_mut(1).unwrap().alloc(4096).unwrap();
    let other = h.ctx.device_pool_mut(2).unwrap().alloc(4096).unwrap();
    assert_ne!(input, other);

    let staging = h.ctx.pinned_pool_mut(1).unwrap().alloc(16).unwrap();
    h.ctx
        .pinned_pool(1)
        .unwrap()
        .write(&staging, b"0123456789abcdef")
        .unwrap();
    let mut out = [0u8; 16];
    h.ctx.pinned_pool(1).unwrap().read(&staging, &mut out).unwrap();
    assert_eq!(&out, b"0123456789abcdef");

    h.ctx.device_pool_mut(1).unwrap().reset();
    assert_eq!(h.ctx.device_pool(1).unwrap().used(), 0);
}

#[test]
fn test_blocking_sync_timeout_policy() {
    let mut config = DeviceContextConfig::default();
    config.sync = SyncPolicy {
        poll_interval_us: 200,
        timeout_ms: Some(10),
    };
    let mut h = harness_with(config, 512 * MB);
    h.ctx.init(MB, 1).unwrap();

    h.ctx.clear_checkbits(1, 2).unwrap();
    h.ctx.set_state(1, StreamState::WaitKernel).unwrap();
    let err = h.ctx.sync(1, true).unwrap_err();
    assert!(matches!(err, DeviceError::SyncTimeout { stream: 1, waited_ms } if waited_ms >= 10));
    assert_eq!(h.ctx.get_state(1).unwrap(), StreamState::WaitKernel);

    complete_blocks(&h.host, h.ctx.get_dev_checkbits(1).unwrap(), 0..2);
    assert!(h.ctx.sync(1, true).unwrap());
}

#[test]
fn test_teardown_then_accessors_fail() {
    let mut h = harness();
    h.ctx.init(MB, 2).unwrap();
    h.ctx.teardown().unwrap();
    assert_eq!(h.ctx.get_stream(1), Err(DeviceError::NotInitialized));
    assert_eq!(h.ctx.sync(1, false), Err(DeviceError::NotInitialized));
    assert_eq!(h.host.allocated_bytes(), 0);
}

#[test]
fn test_drop_releases_pool() {
    let h = harness();
    let host = Arc::clone(&h.host);
    let sim = Arc::clone(&h.sim);
    let mut ctx = h.ctx;
    ctx.init(MB, 3).unwrap();
    drop(ctx);
    assert_eq!(host.allocated_bytes(), 0);
    assert_eq!(sim.live_streams(), 0);
}
