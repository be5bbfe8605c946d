//! Host backend: devices whose memory lives in system RAM and whose kernels run on the rayon pool.
//!
//! By default the backend reports a single CPU device. A custom device list may also describe
//! GPU-class devices; they are executed on the host as well, which keeps device selection, leasing
//! and pooling testable on machines without accelerators.

mod program;

use std::sync::Arc;

use snafu::ensure;

use crate::buffer::RawBuffer;
use crate::device::{Backend, DeviceHandle, DeviceInfo};
use crate::error::{AllocationSnafu, InvalidBufferSizeSnafu, Result};
use crate::kernel::{KernelSource, Program};
use crate::stream::{Command, Stream};

pub use program::{FusedProgram, HostProgram, compile};

/// Backend whose devices execute on host threads.
#[derive(Debug, Clone)]
pub struct HostBackend {
    devices: Vec<DeviceInfo>,
}

impl HostBackend {
    /// A backend exposing one CPU device named `host`.
    pub fn new() -> Self {
        Self { devices: vec![DeviceInfo::cpu("host", 0)] }
    }

    /// A backend exposing exactly `devices`, in order, duplicates included.
    pub fn with_devices(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        Self { devices: devices.into_iter().collect() }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn create_context(&self, device: &DeviceInfo) -> Result<Arc<dyn DeviceHandle>> {
        Ok(Arc::new(HostDevice::new(device.clone())?))
    }
}

/// Device context of the host backend.
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    stream: Stream,
}

impl HostDevice {
    pub fn new(info: DeviceInfo) -> Result<Self> {
        let stream = Stream::spawn(info.to_string())?;
        Ok(Self { info, stream })
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl DeviceHandle for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc(&self, len: usize) -> Result<Arc<RawBuffer>> {
        ensure!(len > 0, InvalidBufferSizeSnafu { size: len });
        let raw = RawBuffer::try_zeroed(len).map_err(|e| {
            AllocationSnafu { device: self.info.to_string(), size: len, reason: e.to_string() }.build()
        })?;
        Ok(Arc::new(raw))
    }

    fn compile(&self, source: &KernelSource) -> Result<Arc<dyn Program>> {
        let program = compile(source);
        tracing::debug!(device = %self.info, kernel.name = %program.name(), "kernel compiled");
        Ok(program)
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.stream.submit(command).map(drop)
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    fn read(&self, buffer: &RawBuffer, dst: &mut [f32]) -> Result<()> {
        self.stream.read(buffer, dst)
    }
}
