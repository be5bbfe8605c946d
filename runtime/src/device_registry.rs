//! Device registry: enumeration, filtering and deduplication of backend devices.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ResultExt;
use tessera_device::{Backend, DeviceInfo};

use crate::accelerator::Accelerator;
use crate::config::RuntimeConfig;
use crate::error::{DeviceSnafu, Result};

/// Source of process-unique device generations.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// One enumeration of the backend's devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    accelerators: Vec<Accelerator>,
    generation: u64,
    gpu_in_use: bool,
}

impl DeviceRegistry {
    /// Enumerate `backend` and open one accelerator per unique device, in enumeration order.
    ///
    /// GPU-class devices are dropped unless `allow_gpu`. Devices with the same
    /// `(kind, name, memory_size)` are the same physical device and opened once.
    pub fn open(backend: &dyn Backend, allow_gpu: bool, config: &RuntimeConfig) -> Result<Self> {
        let listed = backend.list_devices().context(DeviceSnafu)?;
        let devices = unique_devices(listed, allow_gpu);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        let accelerators = devices
            .iter()
            .enumerate()
            .map(|(id, info)| {
                let device = backend.create_context(info).context(DeviceSnafu)?;
                Ok(Accelerator::new(id, generation, device, config))
            })
            .collect::<Result<Vec<_>>>()?;
        let gpu_in_use = accelerators.iter().any(Accelerator::is_gpu);

        tracing::info!(
            backend = backend.name(),
            generation,
            accelerators = accelerators.len(),
            gpu_in_use,
            devices = ?devices.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "devices refreshed"
        );
        Ok(Self { accelerators, generation, gpu_in_use })
    }

    pub fn accelerators(&self) -> &[Accelerator] {
        &self.accelerators
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn gpu_in_use(&self) -> bool {
        self.gpu_in_use
    }

    /// Drain every accelerator: return deferred buffers and wait for the streams.
    ///
    /// Keeps going past failures and reports the first one.
    pub fn drain(&self) -> Result<()> {
        let mut first = None;
        for accelerator in &self.accelerators {
            if let Err(error) = accelerator.synchronize() {
                tracing::warn!(accelerator = accelerator.id(), %error, "failed to drain accelerator");
                first.get_or_insert(error);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

fn unique_devices(listed: Vec<DeviceInfo>, allow_gpu: bool) -> Vec<DeviceInfo> {
    let mut seen = HashSet::new();
    listed
        .into_iter()
        .filter(|info| allow_gpu || !info.kind.is_gpu())
        .filter(|info| seen.insert(info.clone()))
        .collect()
}
