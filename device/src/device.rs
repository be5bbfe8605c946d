//! Backend boundary.
//!
//! A [`Backend`] enumerates devices and opens one [`DeviceHandle`] per device. The handle owns:
//! - **Allocator**: hands out raw device memory
//! - **Compiler**: turns a [`KernelSource`] into an executable [`Program`]
//! - **Stream**: an in-order queue of [`Command`]s executed asynchronously
//!
//! Everything above this module (pooling, leasing, dispatch, fusion) only talks to these traits, so
//! a vendor backend plugs in by implementing them.

use std::fmt;
use std::sync::Arc;

use crate::buffer::RawBuffer;
use crate::error::{BackendUnavailableSnafu, Result};
use crate::kernel::{KernelSource, Program};
use crate::stream::Command;

/// Device class as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Other,
}

impl DeviceKind {
    pub fn is_gpu(self) -> bool {
        matches!(self, DeviceKind::Gpu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Immutable device descriptor.
///
/// Two descriptors with the same `(kind, name, memory_size)` triple describe the same physical
/// device, so equality and hashing cover exactly that triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub name: String,
    /// Device memory in bytes, 0 when the backend cannot tell.
    pub memory_size: u64,
}

impl DeviceInfo {
    pub fn new(kind: DeviceKind, name: impl Into<String>, memory_size: u64) -> Self {
        Self { kind, name: name.into(), memory_size }
    }

    pub fn cpu(name: impl Into<String>, memory_size: u64) -> Self {
        Self::new(DeviceKind::Cpu, name, memory_size)
    }

    pub fn gpu(name: impl Into<String>, memory_size: u64) -> Self {
        Self::new(DeviceKind::Gpu, name, memory_size)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// An open device context.
///
/// All submissions to one handle execute in submission order. Only [`DeviceHandle::synchronize`]
/// and [`DeviceHandle::read`] block the caller.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Descriptor this context was created from.
    fn info(&self) -> &DeviceInfo;

    /// Allocate `len` elements of device memory.
    fn alloc(&self, len: usize) -> Result<Arc<RawBuffer>>;

    /// Give memory back to the device allocator.
    ///
    /// Commands still queued against `buffer` keep their own reference, so the memory is reclaimed
    /// once the last of them has run.
    fn free(&self, buffer: Arc<RawBuffer>) {
        drop(buffer);
    }

    /// Compile a kernel for this device.
    fn compile(&self, source: &KernelSource) -> Result<Arc<dyn Program>>;

    /// Enqueue a command on the device stream without waiting for it.
    fn submit(&self, command: Command) -> Result<()>;

    /// Block until every previously submitted command has completed.
    fn synchronize(&self) -> Result<()>;

    /// Copy device memory to the host once all prior work touching it has completed.
    fn read(&self, buffer: &RawBuffer, dst: &mut [f32]) -> Result<()>;
}

/// Handle to an optional vendor-accelerated library (BLAS and friends).
///
/// The runtime never calls into it; it only records whether initialization succeeded so that
/// consumers can pick between the library and the generic kernel path.
pub trait AcceleratedLibrary: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
}

/// Device enumeration capability.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// List devices in enumeration order. Duplicates are allowed here.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a context (allocator, compiler and stream) for `device`.
    fn create_context(&self, device: &DeviceInfo) -> Result<Arc<dyn DeviceHandle>>;

    /// Initialize the accelerated library for `device`.
    fn init_library(&self, device: &DeviceInfo) -> Result<Arc<dyn AcceleratedLibrary>> {
        BackendUnavailableSnafu {
            device: device.to_string(),
            reason: format!("backend '{}' ships no accelerated library", self.name()),
        }
        .fail()
    }
}
