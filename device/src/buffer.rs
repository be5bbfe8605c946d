use std::collections::TryReserveError;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ensure;

use crate::error::{Result, SizeMismatchSnafu};

/// Fixed-size block of `f32` device memory.
///
/// The memory is written by the device stream and read by the host only after the stream has
/// drained, so accessors that touch the contents are `unsafe` and leave ordering to the caller.
/// A buffer is bound to the first stream it is submitted to and refused by every other stream.
pub struct RawBuffer {
    ptr: NonNull<f32>,
    len: usize,
    /// Id of the owning stream; 0 while unbound.
    stream: AtomicU64,
}

// SAFETY: RawBuffer owns its allocation exclusively. Concurrent access is coordinated by the
// single stream it is bound to: commands run in submission order, kernels write disjoint lanes,
// and host reads hold the stream's submit gate.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    /// Allocate `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    /// Like [`RawBuffer::zeroed`], but reports allocation failure instead of aborting.
    pub fn try_zeroed(len: usize) -> std::result::Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0.0);
        Ok(Self::from_vec(data))
    }

    fn from_vec(data: Vec<f32>) -> Self {
        let len = data.len();
        let data: &mut [f32] = Box::leak(data.into_boxed_slice());
        Self { ptr: NonNull::from(data).cast(), len, stream: AtomicU64::new(0) }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address, also used as the allocation identity.
    pub fn as_ptr(&self) -> *mut f32 {
        self.ptr.as_ptr()
    }

    /// Bind to `stream` unless already bound elsewhere. Returns whether the buffer belongs to `stream`.
    pub(crate) fn bind(&self, stream: u64) -> bool {
        match self.stream.compare_exchange(0, stream, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(owner) => owner == stream,
        }
    }

    /// Overwrite every element with `value`.
    ///
    /// # Safety
    ///
    /// No other command may access the buffer concurrently.
    pub unsafe fn fill(&self, value: f32) {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len) }.fill(value);
    }

    /// Copy host data into the buffer.
    ///
    /// # Safety
    ///
    /// No other command may access the buffer concurrently.
    pub unsafe fn copy_from(&self, src: &[f32]) -> Result<()> {
        ensure!(src.len() == self.len, SizeMismatchSnafu { expected: self.len, actual: src.len() });
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len) }.copy_from_slice(src);
        Ok(())
    }

    /// Copy the buffer contents to the host.
    ///
    /// # Safety
    ///
    /// All commands writing the buffer must have completed.
    pub unsafe fn copy_to(&self, dst: &mut [f32]) -> Result<()> {
        ensure!(dst.len() == self.len, SizeMismatchSnafu { expected: self.len, actual: dst.len() });
        dst.copy_from_slice(unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) });
        Ok(())
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a leaked boxed slice in `from_vec`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)) });
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("stream", &self.stream.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a device buffer owned by one accelerator.
///
/// Cloning the handle does not copy memory. A buffer handed to a deferred-return list stays usable
/// by the caller until the owner flushes; after that every clone must be treated as freed.
#[derive(Debug, Clone)]
pub struct Buffer {
    raw: Arc<RawBuffer>,
    accelerator: usize,
    generation: u64,
}

impl Buffer {
    pub fn new(raw: Arc<RawBuffer>, accelerator: usize, generation: u64) -> Self {
        Self { raw, accelerator, generation }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Index of the owning accelerator.
    pub fn accelerator(&self) -> usize {
        self.accelerator
    }

    /// Device generation the buffer was allocated under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity of the underlying allocation.
    ///
    /// Two handles share memory exactly when their ids match, which makes pool reuse observable.
    pub fn id(&self) -> usize {
        self.raw.as_ptr() as usize
    }

    pub fn raw(&self) -> &Arc<RawBuffer> {
        &self.raw
    }

    pub fn into_raw(self) -> Arc<RawBuffer> {
        self.raw
    }
}
