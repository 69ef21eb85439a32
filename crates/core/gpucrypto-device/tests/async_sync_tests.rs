//! Async completion wait tests
#![cfg(feature = "async")]

use std::sync::Arc;
use std::time::Duration;

use gpucrypto_device::{
    DeviceContext, DeviceContextConfig, DeviceError, SimulatedRuntime, StreamState, SyncPolicy,
};
use gpucrypto_mem::HostAllocator;

fn context(config: DeviceContextConfig) -> (Arc<HostAllocator>, Arc<SimulatedRuntime>, DeviceContext) {
    let host = Arc::new(HostAllocator::new(64 << 20));
    let sim = Arc::new(SimulatedRuntime::new());
    let ctx = DeviceContext::with_config(config, sim.clone(), host.clone()).unwrap();
    (host, sim, ctx)
}

#[tokio::test]
async fn test_sync_async_waits_for_kernel() {
    let (host, _sim, mut ctx) = context(DeviceContextConfig::default());
    ctx.init(1 << 16, 2).unwrap();

    ctx.clear_checkbits(2, 32).unwrap();
    ctx.set_state(2, StreamState::WaitKernel).unwrap();
    let bits = ctx.get_dev_checkbits(2).unwrap();

    let device = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2)).await;
        for block in 0..32 {
            host.device_store(bits.offset(block), 1).unwrap();
        }
    });

    assert!(ctx.sync_async(2).await.unwrap());
    device.await.unwrap();
    assert_eq!(ctx.get_state(2).unwrap(), StreamState::Ready);
    assert!(ctx.get_elapsed_time(2).unwrap() >= 2_000);
}

#[tokio::test]
async fn test_sync_async_copy_completion() {
    let (_host, sim, mut ctx) = context(DeviceContextConfig::default());
    ctx.init(1 << 16, 1).unwrap();
    let handle = ctx.get_stream(1).unwrap();

    sim.begin_copy(handle).unwrap();
    ctx.set_state(1, StreamState::WaitCopy).unwrap();
    sim.complete_copy(handle).unwrap();

    assert!(ctx.sync_async(1).await.unwrap());
    assert_eq!(ctx.get_state(1).unwrap(), StreamState::Ready);
}

#[tokio::test]
async fn test_sync_async_timeout() {
    let mut config = DeviceContextConfig::default();
    config.sync = SyncPolicy {
        poll_interval_us: 500,
        timeout_ms: Some(5),
    };
    let (_host, _sim, mut ctx) = context(config);
    ctx.init(1 << 16, 1).unwrap();

    ctx.clear_checkbits(1, 4).unwrap();
    ctx.set_state(1, StreamState::WaitKernel).unwrap();
    assert!(matches!(
        ctx.sync_async(1).await,
        Err(DeviceError::SyncTimeout { stream: 1, .. })
    ));
    assert_eq!(ctx.get_state(1).unwrap(), StreamState::WaitKernel);
}
