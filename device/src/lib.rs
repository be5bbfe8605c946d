//! Device layer of tessera.
//!
//! Provides the backend boundary (device enumeration, allocation, compilation, command streams),
//! raw device memory, the size-bucketed buffer pool and the host backend.

pub mod buffer;
pub mod device;
pub mod error;
pub mod host;
pub mod kernel;
pub mod pool;
pub mod stream;
pub mod sync;


pub use buffer::{Buffer, RawBuffer};
pub use device::{AcceleratedLibrary, Backend, DeviceHandle, DeviceInfo, DeviceKind};
pub use error::*;
pub use host::{HostBackend, HostDevice};
pub use kernel::{
    BinaryOp, FusedPlan, FusedStep, HostKernel, KernelArg, KernelArgs, KernelParams, KernelSource, Lane,
    MAX_FUSED_STEPS, ParamKind, Program, Slot, launch_range,
};
pub use pool::{BufferPool, PoolPolicy, PoolStats};
pub use stream::{Command, Stream};
pub use sync::{HostSignal, TimelineSignal};
