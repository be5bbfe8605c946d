use tessera_device::{DeviceInfo, HostKernel, ParamKind};

use crate::test::{add, host_runtime, mul, runtime_with, sub};
use crate::{Error, RuntimeConfig, kernels};

#[test]
fn test_load_compiles_per_accelerator() {
    let rt = runtime_with([DeviceInfo::cpu("a", 0), DeviceInfo::cpu("b", 0)], RuntimeConfig::default());
    let table = rt.load(kernels::add()).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table.name(), "add");
    assert_eq!(table.params(), &[ParamKind::Buffer; 3]);
    assert_eq!(table.generation(), rt.generation());
}

#[test]
fn test_call_forwards_scalars() {
    let rt = host_runtime();
    let scale = rt.load(kernels::scale()).unwrap();
    let a = rt.make(0, &[1.0, 2.0, 3.0]).unwrap();
    let out = rt.get(0, 3).unwrap();

    rt.call(0, &scale, (&out, &a, 0.5f32)).unwrap();
    assert_eq!(rt.to_host(&out).unwrap(), vec![0.5, 1.0, 1.5]);
}

#[test]
fn test_call_four_arguments() {
    let rt = host_runtime();
    let axpy = rt.load(kernels::axpy()).unwrap();
    let x = rt.make(0, &[1.0, 2.0]).unwrap();
    let y = rt.make(0, &[10.0, 20.0]).unwrap();
    let out = rt.get(0, 2).unwrap();

    rt.call(0, &axpy, (&out, &x, &y, 3.0f32)).unwrap();
    assert_eq!(rt.to_host(&out).unwrap(), vec![13.0, 26.0]);
}

#[test]
fn test_range_follows_first_buffer() {
    let rt = host_runtime();
    let copy = rt.load(HostKernel::new("copy", [ParamKind::Buffer, ParamKind::Buffer], |lane| {
        lane.store(0, lane.load(1))
    }))
    .unwrap();
    let src = rt.make(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let dst = rt.get(0, 2).unwrap();

    rt.call(0, &copy, (&dst, &src)).unwrap();
    assert_eq!(rt.to_host(&dst).unwrap(), vec![1.0, 2.0]);

    // A shorter input than the range is rejected before anything is queued.
    let long = rt.get(0, 8).unwrap();
    let result = rt.call(0, &copy, (&long, &src));
    assert!(matches!(result, Err(Error::Device { source: tessera_device::Error::ArgumentLength { .. } })));
}

#[test]
fn test_unary_and_binary_calls() {
    let rt = host_runtime();
    let sqrt = rt.load(kernels::sqrt()).unwrap();
    let sub = rt.load(kernels::sub()).unwrap();
    let a = rt.make(0, &[4.0, 9.0]).unwrap();
    let b = rt.make(0, &[1.0, 1.0]).unwrap();

    let root = rt.unary_call(&sqrt, &a).unwrap();
    let diff = rt.binary_call(&sub, &a, &b).unwrap();

    assert_eq!(rt.to_host(&root).unwrap(), vec![2.0, 3.0]);
    assert_eq!(rt.to_host(&diff).unwrap(), vec![3.0, 8.0]);
    assert_ne!(root.id(), a.id());
}

#[test]
fn test_wrong_signature_rejected() {
    let rt = host_runtime();
    let add = rt.load(kernels::add()).unwrap();
    let a = rt.make(0, &[1.0]).unwrap();

    let result = rt.call(0, &add, (&a, &a));
    assert!(matches!(result, Err(Error::Device { source: tessera_device::Error::ArgumentCount { .. } })));

    let result = rt.call(0, &add, (&a, &a, 1.0f32));
    assert!(matches!(result, Err(Error::Device { source: tessera_device::Error::ArgumentKind { index: 2, .. } })));
}

#[test]
fn test_call_chain_matches_step_by_step() {
    let rt = host_runtime();
    let add = rt.load_binary(&add()).unwrap();
    let mul = rt.load_binary(&mul()).unwrap();
    let sub = rt.load_binary(&sub()).unwrap();
    let a = rt.make(0, &[1.0, 2.0]).unwrap();
    let b = rt.make(0, &[3.0, 4.0]).unwrap();
    let c = rt.make(0, &[2.0, 2.0]).unwrap();
    let d = rt.make(0, &[1.0, 1.0]).unwrap();

    let out = rt.binary_call_chain(&a, &[(&add, &b), (&mul, &c), (&sub, &d)]).unwrap();
    assert_eq!(rt.to_host(&out).unwrap(), vec![7.0, 11.0]);
    assert_eq!(rt.to_host(&a).unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_call_chain_allocates_one_buffer() {
    let rt = host_runtime();
    let add = rt.load_binary(&add()).unwrap();
    let mul = rt.load_binary(&mul()).unwrap();
    let inputs: Vec<_> = (0..4).map(|i| rt.make(0, &[i as f32; 64]).unwrap()).collect();
    let before = rt.pool_stats(0).unwrap();

    let steps = [(&add, &inputs[1]), (&mul, &inputs[2]), (&add, &inputs[3]), (&mul, &inputs[1])];
    rt.binary_call_chain(&inputs[0], &steps).unwrap();

    let after = rt.pool_stats(0).unwrap();
    assert_eq!(after.allocations, before.allocations + 1);
    assert_eq!(after.high_water, before.high_water + 1);
}

#[test]
fn test_empty_call_chain_rejected() {
    let rt = host_runtime();
    let a = rt.make(0, &[1.0]).unwrap();
    assert!(matches!(rt.binary_call_chain(&a, &[]), Err(Error::InvalidArgument { .. })));
}

#[test]
fn test_foreign_buffer_rejected() {
    let rt = runtime_with([DeviceInfo::cpu("a", 0), DeviceInfo::cpu("b", 0)], RuntimeConfig::default());
    let add = rt.load(kernels::add()).unwrap();
    let out = rt.get(0, 2).unwrap();
    let local = rt.make(0, &[1.0, 2.0]).unwrap();
    let remote = rt.make(1, &[1.0, 2.0]).unwrap();

    let result = rt.call(0, &add, (&out, &local, &remote));
    assert!(matches!(result, Err(Error::ForeignBuffer { argument: 2, .. })));
}

#[test]
fn test_stale_kernel_rejected() {
    let mut rt = host_runtime();
    let add = rt.load(kernels::add()).unwrap();
    rt.refresh_devices(true).unwrap();

    let a = rt.make(0, &[1.0]).unwrap();
    let result = rt.binary_call(&add, &a, &a);
    assert!(matches!(result, Err(Error::StaleKernel { .. })));
}

#[test]
fn test_failed_calls_return_their_output() {
    let mut rt = host_runtime();
    let neg = rt.load(kernels::neg()).unwrap();
    let add = rt.load(kernels::add()).unwrap();
    rt.refresh_devices(true).unwrap();

    let a = rt.make(0, &[1.0, 2.0]).unwrap();
    let before = rt.pool_stats(0).unwrap();

    for _ in 0..3 {
        assert!(matches!(rt.unary_call(&neg, &a), Err(Error::StaleKernel { .. })));
        assert!(matches!(rt.binary_call(&add, &a, &a), Err(Error::StaleKernel { .. })));
    }

    let after = rt.pool_stats(0).unwrap();
    assert_eq!(after.outstanding, before.outstanding);
    assert_eq!(after.allocations, before.allocations + 1);
    assert_eq!(after.high_water, before.high_water + 1);
    assert_eq!(rt.pooled(0, 2).unwrap(), 1);
}

#[test]
fn test_chain_failing_midway_returns_its_output() {
    let rt = runtime_with([DeviceInfo::cpu("a", 0), DeviceInfo::cpu("b", 0)], RuntimeConfig::default());
    let add = rt.load(kernels::add()).unwrap();
    let a = rt.make(0, &[1.0, 2.0]).unwrap();
    let remote = rt.make(1, &[1.0, 2.0]).unwrap();
    let before = rt.pool_stats(0).unwrap();

    let result = rt.binary_call_chain(&a, &[(&add, &a), (&add, &remote)]);
    assert!(matches!(result, Err(Error::ForeignBuffer { argument: 2, .. })));

    let after = rt.pool_stats(0).unwrap();
    assert_eq!(after.outstanding, before.outstanding);
    assert_eq!(rt.pooled(0, 2).unwrap(), 1);

    // The returned output is the next buffer handed out, zeroed behind the first step's write.
    let next = rt.get(0, 2).unwrap();
    assert_eq!(rt.to_host(&next).unwrap(), vec![0.0, 0.0]);
    assert_eq!(rt.pool_stats(0).unwrap().reuses, after.reuses + 1);
}

#[test]
fn test_interpreted_lambda_kernel() {
    let rt = host_runtime();
    let lambda = crate::BinaryLambda::new(|x, y| (x * 2.0 - y).abs().max(crate::Expr::constant(1.0)));
    let table = rt.load_binary(&lambda).unwrap();
    let a = rt.make(0, &[1.0, 1.0]).unwrap();
    let b = rt.make(0, &[5.0, 2.5]).unwrap();

    let out = rt.binary_call(&table, &a, &b).unwrap();
    assert_eq!(rt.to_host(&out).unwrap(), vec![3.0, 1.0]);
}
