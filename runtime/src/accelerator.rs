//! Accelerator context: one opened device plus its bookkeeping.
//!
//! Buffer lifecycle on one accelerator:
//!
//! ```text
//! get ──► Vended ──return_buffer──► Pooled ──get──► Vended
//!            │                        ▲
//!            └──defer──► Deferred ──flush/synchronize
//! ```
//!
//! Every vended buffer gets a zero fill queued on the device stream, so the next command that reads
//! it sees zeros whatever the previous user left behind.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use snafu::ResultExt;
use tessera_device::{
    AcceleratedLibrary, Backend, Buffer, BufferPool, Command, DeviceHandle, DeviceInfo, PoolStats,
};

use crate::config::RuntimeConfig;
use crate::error::{DeviceSnafu, Result};

/// One opened device with its buffer pool, deferred-return list and lease count.
///
/// Shared by reference from the registry; all mutable state sits behind locks or atomics.
pub struct Accelerator {
    /// Position in the registry's accelerator list.
    id: usize,
    /// Device generation this context was opened under.
    generation: u64,
    /// Device context; owns the command stream.
    device: Arc<dyn DeviceHandle>,
    /// Outstanding leases. Advisory only.
    uses: AtomicUsize,
    /// Free buffers by element count.
    pool: Mutex<BufferPool>,
    /// Buffers to return at the next flush.
    deferred: Mutex<Vec<Buffer>>,
    /// Accelerated library, resolved on first request. `None` records a failed initialization.
    library: OnceLock<Option<Arc<dyn AcceleratedLibrary>>>,
}

impl Accelerator {
    pub(crate) fn new(id: usize, generation: u64, device: Arc<dyn DeviceHandle>, config: &RuntimeConfig) -> Self {
        Self {
            id,
            generation,
            device,
            uses: AtomicUsize::new(0),
            pool: Mutex::new(BufferPool::with_capacity(config.pool_policy, config.max_pooled_per_size)),
            deferred: Mutex::new(Vec::new()),
            library: OnceLock::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn is_gpu(&self) -> bool {
        self.info().kind.is_gpu()
    }

    pub fn device(&self) -> &Arc<dyn DeviceHandle> {
        &self.device
    }

    /// Outstanding leases.
    pub fn uses(&self) -> usize {
        self.uses.load(Ordering::Acquire)
    }

    pub(crate) fn lease(&self) -> usize {
        self.uses.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one lease; `None` when there was none.
    pub(crate) fn unlease(&self) -> Option<usize> {
        self.uses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |uses| uses.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Vend a zero-filled buffer of `len` elements.
    pub fn get(&self, len: usize) -> Result<Buffer> {
        let raw = self.pool.lock().acquire(self.device.as_ref(), len).context(DeviceSnafu)?;
        if let Err(error) = self.device.submit(Command::Fill { dst: Arc::clone(&raw), value: 0.0 }) {
            self.pool.lock().release(self.device.as_ref(), raw);
            return Err(error).context(DeviceSnafu);
        }
        Ok(Buffer::new(raw, self.id, self.generation))
    }

    /// Hand `buffer` back to the pool.
    ///
    /// Other handles to the same allocation must not be used afterwards.
    pub fn put(&self, buffer: Buffer) {
        self.pool.lock().release(self.device.as_ref(), buffer.into_raw());
    }

    /// Register `buffer` for return at the next flush.
    pub fn defer(&self, buffer: Buffer) {
        self.deferred.lock().push(buffer);
    }

    /// Return every deferred buffer to the pool.
    pub fn flush(&self) -> usize {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        let count = deferred.len();
        if count > 0 {
            let mut pool = self.pool.lock();
            for buffer in deferred {
                pool.release(self.device.as_ref(), buffer.into_raw());
            }
            tracing::trace!(accelerator = self.id, count, "deferred buffers returned");
        }
        count
    }

    /// Flush, then block until the device stream has drained.
    ///
    /// Flushing first is sound: a buffer re-vended right away gets its next commands queued behind
    /// everything still reading the old contents on the same stream.
    pub fn synchronize(&self) -> Result<()> {
        self.flush();
        self.device.synchronize().context(DeviceSnafu)
    }

    /// Release all pooled buffers to the device allocator.
    pub fn trim(&self) -> usize {
        self.pool.lock().trim(self.device.as_ref())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.lock().stats()
    }

    pub fn pooled(&self, len: usize) -> usize {
        self.pool.lock().pooled(len)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Accelerated library for this device, initialized on first use.
    ///
    /// A failed initialization is remembered; later calls return `None` without retrying.
    pub fn library(&self, backend: &dyn Backend) -> Option<Arc<dyn AcceleratedLibrary>> {
        self.library
            .get_or_init(|| match backend.init_library(self.info()) {
                Ok(library) => {
                    tracing::debug!(accelerator = self.id, library = library.name(), "accelerated library ready");
                    Some(library)
                }
                Err(error) => {
                    tracing::warn!(accelerator = self.id, %error, "accelerated library unavailable, falling back");
                    None
                }
            })
            .clone()
    }
}

impl fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accelerator")
            .field("id", &self.id)
            .field("device", self.info())
            .field("generation", &self.generation)
            .field("uses", &self.uses())
            .field("deferred", &self.deferred_len())
            .finish()
    }
}
