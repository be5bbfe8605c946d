//! Accelerator leasing strategies.
//!
//! Leases are cooperative: holding an index is enough to use an accelerator, so a lease only steers
//! where the next request lands.

use std::str::FromStr;

use crate::accelerator::Accelerator;
use crate::error::{ResourceExhaustedSnafu, Result};

/// How [`ComputeRuntime::request_accelerator`](crate::ComputeRuntime::request_accelerator) picks an
/// accelerator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Usage counters; the least-used accelerator wins (default).
    #[default]
    Counted,
    /// Busy flags; fails when every accelerator is leased.
    Exclusive,
}

impl LeasePolicy {
    /// Pick an accelerator and record the lease.
    ///
    /// With `prefer_gpu` the first GPU-class accelerator is chosen whenever one exists. Under
    /// counted leasing it is chosen regardless of load; under exclusive leasing only if it is free.
    pub fn acquire(self, accelerators: &[Accelerator], prefer_gpu: bool) -> Result<usize> {
        let index = match self {
            LeasePolicy::Counted => {
                let gpu = prefer_gpu.then(|| accelerators.iter().position(Accelerator::is_gpu)).flatten();
                // min_by_key keeps the first of equal minima.
                gpu.or_else(|| accelerators.iter().enumerate().min_by_key(|(_, acc)| acc.uses()).map(|(i, _)| i))
            }
            LeasePolicy::Exclusive => {
                let free = |acc: &&Accelerator| acc.uses() == 0;
                let gpu = prefer_gpu
                    .then(|| accelerators.iter().enumerate().find(|(_, acc)| acc.is_gpu() && free(acc)))
                    .flatten();
                gpu.or_else(|| accelerators.iter().enumerate().find(|(_, acc)| free(acc))).map(|(i, _)| i)
            }
        };

        let Some(index) = index else {
            let reason = if accelerators.is_empty() {
                "no accelerators available".to_string()
            } else {
                format!("all {} accelerators are leased", accelerators.len())
            };
            return ResourceExhaustedSnafu { reason }.fail();
        };

        let uses = accelerators[index].lease();
        tracing::debug!(accelerator = index, policy = ?self, uses, "accelerator leased");
        Ok(index)
    }

    /// Undo one lease on `accelerator`. Releasing an accelerator without a lease is ignored.
    pub fn release(self, accelerator: &Accelerator) {
        if accelerator.unlease().is_none() {
            tracing::warn!(accelerator = accelerator.id(), "release without an outstanding lease ignored");
        }
    }
}

impl FromStr for LeasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "counted" => Ok(LeasePolicy::Counted),
            "exclusive" => Ok(LeasePolicy::Exclusive),
            other => Err(format!("unknown leasing policy '{other}'")),
        }
    }
}
