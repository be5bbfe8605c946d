use std::collections::HashMap;
use std::sync::Arc;

use snafu::ensure;

use crate::buffer::RawBuffer;
use crate::device::DeviceHandle;
use crate::error::{InvalidBufferSizeSnafu, Result};

/// Whether returned buffers are kept for reuse.
///
/// The policy applies identically to every device kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Returned buffers go to their size bucket (default).
    #[default]
    Enabled,
    /// Returned buffers are released to the device allocator immediately.
    Disabled,
}

/// Allocation counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh allocations from the device.
    pub allocations: usize,
    /// Requests served from a bucket.
    pub reuses: usize,
    /// Buffers handed back to the device allocator.
    pub releases: usize,
    /// Buffers currently sitting in buckets.
    pub pooled: usize,
    /// Buffers handed out and not yet returned.
    pub outstanding: usize,
    /// Peak of `outstanding`.
    pub high_water: usize,
}

/// Size-bucketed free list for one device.
///
/// Buckets are LIFO stacks keyed by element count: the most recently returned buffer of a size is
/// the next one handed out.
#[derive(Debug, Default)]
pub struct BufferPool {
    buckets: HashMap<usize, Vec<Arc<RawBuffer>>>,
    policy: PoolPolicy,
    max_per_size: Option<usize>,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(policy: PoolPolicy) -> Self {
        Self { policy, ..Default::default() }
    }

    /// Cap each bucket at `max_per_size` buffers; returns beyond the cap are released.
    pub fn with_capacity(policy: PoolPolicy, max_per_size: Option<usize>) -> Self {
        Self { policy, max_per_size, ..Default::default() }
    }

    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Take a buffer of `len` elements, reusing a pooled one when available.
    ///
    /// Contents of a reused buffer are whatever its last user left behind.
    pub fn acquire(&mut self, device: &dyn DeviceHandle, len: usize) -> Result<Arc<RawBuffer>> {
        ensure!(len > 0, InvalidBufferSizeSnafu { size: len });

        let raw = if let Some(bucket) = self.buckets.get_mut(&len)
            && let Some(raw) = bucket.pop()
        {
            if bucket.is_empty() {
                self.buckets.remove(&len);
            }
            self.stats.pooled -= 1;
            self.stats.reuses += 1;
            tracing::trace!(device = %device.info(), len, "pool hit");
            raw
        } else {
            let raw = device.alloc(len)?;
            self.stats.allocations += 1;
            tracing::debug!(device = %device.info(), len, total = self.stats.allocations, "fresh device allocation");
            raw
        };

        self.stats.outstanding += 1;
        self.stats.high_water = self.stats.high_water.max(self.stats.outstanding);
        Ok(raw)
    }

    /// Hand a buffer back, pooling or releasing it according to the policy.
    pub fn release(&mut self, device: &dyn DeviceHandle, raw: Arc<RawBuffer>) {
        self.stats.outstanding = self.stats.outstanding.saturating_sub(1);

        if self.policy == PoolPolicy::Disabled {
            self.free(device, raw);
            return;
        }

        let bucket = self.buckets.entry(raw.len()).or_default();
        if self.max_per_size.is_some_and(|max| bucket.len() >= max) {
            self.free(device, raw);
            return;
        }
        bucket.push(raw);
        self.stats.pooled += 1;
    }

    /// Release every pooled buffer to the device allocator. Returns how many were released.
    pub fn trim(&mut self, device: &dyn DeviceHandle) -> usize {
        let drained: Vec<Arc<RawBuffer>> = self.buckets.drain().flat_map(|(_, bucket)| bucket).collect();
        let count = drained.len();
        for raw in drained {
            self.free(device, raw);
        }
        self.stats.pooled = 0;
        count
    }

    /// Number of pooled buffers of `len` elements.
    pub fn pooled(&self, len: usize) -> usize {
        self.buckets.get(&len).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    fn free(&mut self, device: &dyn DeviceHandle, raw: Arc<RawBuffer>) {
        self.stats.releases += 1;
        device.free(raw);
    }
}
