use std::sync::Arc;

use test_case::test_case;

use crate::{BufferPool, DeviceHandle, DeviceInfo, HostDevice, PoolPolicy, PoolStats};

fn device() -> HostDevice {
    HostDevice::new(DeviceInfo::cpu("pool", 0)).unwrap()
}

#[test]
fn test_pool_reuses_most_recent_return_first() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Enabled);

    let a = pool.acquire(&device, 8).unwrap();
    let b = pool.acquire(&device, 8).unwrap();
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    pool.release(&device, a);
    pool.release(&device, b);
    assert_eq!(pool.pooled(8), 2);

    assert_eq!(pool.acquire(&device, 8).unwrap().as_ptr(), b_ptr);
    assert_eq!(pool.acquire(&device, 8).unwrap().as_ptr(), a_ptr);
    assert_eq!(pool.pooled(8), 0);
}

#[test]
fn test_pool_buckets_by_exact_size() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Enabled);

    let raw = pool.acquire(&device, 8).unwrap();
    pool.release(&device, raw);

    let other = pool.acquire(&device, 9).unwrap();
    assert_eq!(other.len(), 9);
    assert_eq!(pool.pooled(8), 1);
    assert_eq!(pool.stats().allocations, 2);
}

#[test]
fn test_pool_stats_track_outstanding_buffers() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Enabled);

    let a = pool.acquire(&device, 4).unwrap();
    let b = pool.acquire(&device, 4).unwrap();
    pool.release(&device, a);
    let c = pool.acquire(&device, 4).unwrap();
    pool.release(&device, b);
    pool.release(&device, c);

    assert_eq!(
        pool.stats(),
        PoolStats { allocations: 2, reuses: 1, releases: 0, pooled: 2, outstanding: 0, high_water: 2 }
    );
}

#[test]
fn test_disabled_pool_frees_on_return() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Disabled);

    let raw = pool.acquire(&device, 16).unwrap();
    pool.release(&device, raw);

    assert_eq!(pool.pooled(16), 0);
    assert_eq!(pool.stats().releases, 1);

    pool.acquire(&device, 16).unwrap();
    assert_eq!(pool.stats().allocations, 2);
}

#[test_case(Some(1), 1 ; "capped at one")]
#[test_case(Some(3), 3 ; "capped at three")]
#[test_case(None, 4 ; "uncapped")]
fn test_pool_bucket_cap(max_per_size: Option<usize>, expected: usize) {
    let device = device();
    let mut pool = BufferPool::with_capacity(PoolPolicy::Enabled, max_per_size);

    let buffers: Vec<_> = (0..4).map(|_| pool.acquire(&device, 2).unwrap()).collect();
    for raw in buffers {
        pool.release(&device, raw);
    }

    assert_eq!(pool.pooled(2), expected);
    assert_eq!(pool.stats().releases, 4 - expected);
}

#[test]
fn test_trim_releases_everything() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Enabled);

    for len in [1, 2, 2, 3] {
        let raw = pool.acquire(&device, len).unwrap();
        pool.release(&device, raw);
    }
    // The second size-2 request reuses the first one.
    assert_eq!(pool.trim(&device), 3);
    assert_eq!(pool.stats().pooled, 0);
    assert_eq!(pool.pooled(2), 0);
}

#[test]
fn test_zero_length_request_rejected() {
    let device = device();
    let mut pool = BufferPool::default();
    assert!(matches!(pool.acquire(&device, 0), Err(crate::Error::InvalidBufferSize { size: 0 })));
    assert_eq!(pool.stats().outstanding, 0);
}

#[test]
fn test_reused_buffer_keeps_previous_contents() {
    let device = device();
    let mut pool = BufferPool::new(PoolPolicy::Enabled);

    let raw = pool.acquire(&device, 3).unwrap();
    unsafe { raw.copy_from(&[1.0, 2.0, 3.0]) }.unwrap();
    pool.release(&device, raw);

    let reused = pool.acquire(&device, 3).unwrap();
    let mut host = vec![0.0; 3];
    device.read(&reused, &mut host).unwrap();
    assert_eq!(host, vec![1.0, 2.0, 3.0]);
    assert_eq!(Arc::strong_count(&reused), 1);
}
