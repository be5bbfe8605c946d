use tessera_device::DeviceInfo;
use test_case::test_case;

use crate::test::{mixed_devices, runtime_with};
use crate::{ComputeRuntime, Error, LeasePolicy, RuntimeConfig};

fn mixed(leasing: LeasePolicy) -> ComputeRuntime {
    runtime_with(mixed_devices(), RuntimeConfig::builder().leasing(leasing).build())
}

fn uses(rt: &ComputeRuntime) -> Vec<usize> {
    rt.accelerators().iter().map(|accelerator| accelerator.uses()).collect()
}

#[test]
fn test_counted_prefers_gpu_regardless_of_load() {
    let rt = mixed(LeasePolicy::Counted);
    for _ in 0..5 {
        assert_eq!(rt.request_accelerator(true).unwrap(), 1);
    }
    assert_eq!(uses(&rt), vec![0, 5, 0]);
}

#[test]
fn test_counted_picks_least_used() {
    let rt = mixed(LeasePolicy::Counted);
    let picks: Vec<_> = (0..4).map(|_| rt.request_accelerator(false).unwrap()).collect();
    assert_eq!(picks, vec![0, 1, 2, 0]);

    rt.release_accelerator(1).unwrap();
    assert_eq!(rt.request_accelerator(false).unwrap(), 1);
}

#[test]
fn test_counted_without_gpu_falls_back_to_least_used() {
    let rt = runtime_with([DeviceInfo::cpu("a", 0), DeviceInfo::cpu("b", 0)], RuntimeConfig::default());
    assert_eq!(rt.request_accelerator(true).unwrap(), 0);
    assert_eq!(rt.request_accelerator(true).unwrap(), 1);
}

#[test_case(LeasePolicy::Counted, true ; "counted gpu")]
#[test_case(LeasePolicy::Counted, false ; "counted any")]
#[test_case(LeasePolicy::Exclusive, true ; "exclusive gpu")]
#[test_case(LeasePolicy::Exclusive, false ; "exclusive any")]
fn test_request_release_pairs_are_neutral(leasing: LeasePolicy, prefer_gpu: bool) {
    let rt = mixed(leasing);
    let before = uses(&rt);
    for _ in 0..3 {
        let index = rt.request_accelerator(prefer_gpu).unwrap();
        rt.release_accelerator(index).unwrap();
    }
    assert_eq!(uses(&rt), before);
}

#[test]
fn test_exclusive_exhaustion() {
    let rt = mixed(LeasePolicy::Exclusive);
    assert_eq!(rt.request_accelerator(true).unwrap(), 1);
    assert_eq!(rt.request_accelerator(true).unwrap(), 0);
    assert_eq!(rt.request_accelerator(false).unwrap(), 2);
    assert!(matches!(rt.request_accelerator(false), Err(Error::ResourceExhausted { .. })));

    rt.release_accelerator(1).unwrap();
    assert_eq!(rt.request_accelerator(true).unwrap(), 1);
}

#[test_case(LeasePolicy::Counted ; "counted")]
#[test_case(LeasePolicy::Exclusive ; "exclusive")]
fn test_no_accelerators(leasing: LeasePolicy) {
    let config = RuntimeConfig::builder().allow_gpu(false).leasing(leasing).build();
    let rt = runtime_with([DeviceInfo::gpu("gpu", 1 << 30)], config);

    assert!(rt.accelerators().is_empty());
    assert!(matches!(rt.request_accelerator(true), Err(Error::ResourceExhausted { .. })));
}

#[test]
fn test_release_without_lease_is_ignored() {
    let rt = mixed(LeasePolicy::Counted);
    rt.release_accelerator(0).unwrap();
    assert_eq!(uses(&rt), vec![0, 0, 0]);
    assert!(matches!(rt.release_accelerator(7), Err(Error::DeviceNotFound { index: 7, count: 3 })));
}

#[test]
fn test_lease_guard_releases_on_drop() {
    let rt = mixed(LeasePolicy::Exclusive);
    {
        let lease = rt.lease(true).unwrap();
        assert_eq!(lease.index(), 1);
        assert!(lease.accelerator().is_gpu());
        assert_eq!(uses(&rt), vec![0, 1, 0]);
    }
    assert_eq!(uses(&rt), vec![0, 0, 0]);
}

#[test]
fn test_leases_are_advisory() {
    let rt = mixed(LeasePolicy::Exclusive);
    let _lease = rt.lease(true).unwrap();
    let buffer = rt.get(1, 4).unwrap();
    assert_eq!(rt.to_host(&buffer).unwrap(), vec![0.0; 4]);
}
