use std::sync::Arc;

use smallvec::smallvec;

use crate::{
    Backend, BinaryOp, Command, DeviceHandle, DeviceInfo, DeviceKind, FusedPlan, FusedStep, HostBackend, HostDevice,
    HostKernel, KernelArg, KernelSource, ParamKind, Slot, launch_range,
};

fn device() -> HostDevice {
    HostDevice::new(DeviceInfo::cpu("test", 0)).unwrap()
}

fn upload(device: &HostDevice, data: &[f32]) -> Arc<crate::RawBuffer> {
    let raw = device.alloc(data.len()).unwrap();
    device.submit(Command::CopyIn { dst: Arc::clone(&raw), data: data.to_vec() }).unwrap();
    raw
}

fn download(device: &HostDevice, raw: &crate::RawBuffer) -> Vec<f32> {
    let mut host = vec![0.0; raw.len()];
    device.read(raw, &mut host).unwrap();
    host
}

#[test]
fn test_host_backend_default_device() {
    let backend = HostBackend::default();
    let devices = backend.list_devices().unwrap();

    assert_eq!(devices, vec![DeviceInfo::cpu("host", 0)]);
    assert_eq!(devices[0].kind, DeviceKind::Cpu);
    assert_eq!(devices[0].to_string(), "CPU:host");
}

#[test]
fn test_host_backend_has_no_accelerated_library() {
    let backend = HostBackend::default();
    let result = backend.init_library(&DeviceInfo::cpu("host", 0));
    assert!(matches!(result, Err(crate::Error::BackendUnavailable { .. })));
}

#[test]
fn test_device_info_identity_is_the_triple() {
    assert_eq!(DeviceInfo::gpu("a", 8), DeviceInfo::gpu("a", 8));
    assert_ne!(DeviceInfo::gpu("a", 8), DeviceInfo::gpu("a", 16));
    assert_ne!(DeviceInfo::gpu("a", 8), DeviceInfo::cpu("a", 8));
}

#[test]
fn test_zero_sized_allocation_rejected() {
    assert!(matches!(device().alloc(0), Err(crate::Error::InvalidBufferSize { size: 0 })));
}

#[test]
fn test_oversized_allocation_reported() {
    assert!(matches!(device().alloc(usize::MAX), Err(crate::Error::Allocation { .. })));
}

#[test]
fn test_host_kernel_launch() {
    let device = device();
    let params = [ParamKind::Buffer, ParamKind::Buffer, ParamKind::Buffer, ParamKind::Scalar];
    let kernel = HostKernel::new("axpy", params, |lane| lane.store(0, lane.scalar(3) * lane.load(1) + lane.load(2)));
    let program = device.compile(&KernelSource::Host(kernel)).unwrap();

    let out = device.alloc(3).unwrap();
    let x = upload(&device, &[1.0, 2.0, 3.0]);
    let y = upload(&device, &[10.0, 20.0, 30.0]);
    let args = smallvec![
        KernelArg::Buffer(Arc::clone(&out)),
        KernelArg::Buffer(x),
        KernelArg::Buffer(y),
        KernelArg::Scalar(2.0),
    ];
    let range = launch_range(program.name(), program.params(), &args).unwrap();
    device.submit(Command::Launch { program, args, range }).unwrap();

    assert_eq!(download(&device, &out), vec![12.0, 24.0, 36.0]);
}

#[test]
fn test_fused_launch_in_place() {
    let device = device();
    let plan = FusedPlan::new([
        FusedStep::new(BinaryOp::Add, Slot::Accumulator, Slot::Operand),
        FusedStep::new(BinaryOp::Mul, Slot::Accumulator, Slot::Operand),
    ])
    .unwrap();
    let program = device.compile(&KernelSource::Fused(plan)).unwrap();

    // Output aliases the initial buffer.
    let a = upload(&device, &[1.0, 2.0]);
    let b = upload(&device, &[3.0, 4.0]);
    let c = upload(&device, &[2.0, 2.0]);
    let args = smallvec![
        KernelArg::Buffer(Arc::clone(&a)),
        KernelArg::Buffer(Arc::clone(&a)),
        KernelArg::Buffer(b),
        KernelArg::Buffer(c),
    ];
    device.submit(Command::Launch { program, args, range: 0..2 }).unwrap();

    assert_eq!(download(&device, &a), vec![8.0, 12.0]);
}

#[test]
fn test_launch_range_validation() {
    let params = [ParamKind::Buffer, ParamKind::Scalar];
    let short = Arc::new(crate::RawBuffer::zeroed(2));
    let long = Arc::new(crate::RawBuffer::zeroed(5));

    let ok = [KernelArg::Buffer(Arc::clone(&long)), KernelArg::Scalar(1.0)];
    assert_eq!(launch_range("k", &params, &ok).unwrap(), 0..5);

    let wrong_kind = [KernelArg::Scalar(1.0), KernelArg::Scalar(1.0)];
    assert!(matches!(launch_range("k", &params, &wrong_kind), Err(crate::Error::ArgumentKind { index: 0, .. })));

    let wrong_count = [KernelArg::Buffer(Arc::clone(&long))];
    assert!(matches!(launch_range("k", &params, &wrong_count), Err(crate::Error::ArgumentCount { .. })));

    let scalars = [ParamKind::Scalar];
    assert!(matches!(launch_range("k", &scalars, &[KernelArg::Scalar(0.0)]), Err(crate::Error::MissingRange { .. })));

    let two = [ParamKind::Buffer, ParamKind::Buffer];
    let too_short = [KernelArg::Buffer(long), KernelArg::Buffer(short)];
    assert!(matches!(launch_range("k", &two, &too_short), Err(crate::Error::ArgumentLength { index: 1, .. })));
}

#[test]
fn test_failed_launch_surfaces_on_synchronize() {
    let device = device();
    let kernel = HostKernel::new("copy", [ParamKind::Buffer, ParamKind::Buffer], |lane| lane.store(0, lane.load(1)));
    let program = device.compile(&KernelSource::Host(kernel)).unwrap();

    let out = device.alloc(4).unwrap();
    let input = device.alloc(2).unwrap();
    let args = smallvec![KernelArg::Buffer(out), KernelArg::Buffer(input)];
    device.submit(Command::Launch { program, args, range: 0..4 }).unwrap();

    assert!(matches!(device.synchronize(), Err(crate::Error::StreamFault { .. })));
}

#[test]
fn test_invalid_fused_plan() {
    assert!(matches!(FusedPlan::new([]), Err(crate::Error::InvalidPlan { steps: 0 })));

    let step = FusedStep::new(BinaryOp::Add, Slot::Accumulator, Slot::Operand);
    assert!(FusedPlan::new([step; 3]).is_ok());
    assert!(matches!(FusedPlan::new([step; 4]), Err(crate::Error::InvalidPlan { steps: 4 })));
}
