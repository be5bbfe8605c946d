//! Runtime configuration.
//!
//! Provides typed configuration with a bon builder and environment variable fallbacks.

use bon::bon;
use tessera_device::PoolPolicy;

use crate::lease::LeasePolicy;

/// Configuration for a [`ComputeRuntime`](crate::ComputeRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Keep GPU-class devices when enumerating (default: true).
    pub allow_gpu: bool,
    /// How accelerators are handed out.
    pub leasing: LeasePolicy,
    /// Whether returned buffers are pooled for reuse.
    pub pool_policy: PoolPolicy,
    /// Per-size bucket cap; `None` keeps every returned buffer.
    pub max_pooled_per_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            allow_gpu: true,
            leasing: LeasePolicy::default(),
            pool_policy: PoolPolicy::default(),
            max_pooled_per_size: None,
        }
    }
}

#[bon]
impl RuntimeConfig {
    /// Create a runtime configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = true)] allow_gpu: bool,
        #[builder(default)] leasing: LeasePolicy,
        #[builder(default)] pool_policy: PoolPolicy,
        max_pooled_per_size: Option<usize>,
    ) -> Self {
        Self { allow_gpu, leasing, pool_policy, max_pooled_per_size }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSERA_ALLOW_GPU=0` - Ignore GPU-class devices
    /// * `TESSERA_LEASING=counted|exclusive` - Leasing policy (default: counted)
    /// * `TESSERA_NO_POOL` - Release returned buffers instead of pooling them, if set
    /// * `TESSERA_POOL_MAX_PER_SIZE=N` - Keep at most N pooled buffers per size
    pub fn from_env() -> Self {
        let allow_gpu = std::env::var("TESSERA_ALLOW_GPU").map(|s| s.trim() != "0").unwrap_or(true);
        let leasing = std::env::var("TESSERA_LEASING").ok().and_then(|s| s.parse().ok()).unwrap_or_default();
        let pool_policy =
            if std::env::var("TESSERA_NO_POOL").is_ok() { PoolPolicy::Disabled } else { PoolPolicy::Enabled };
        let max_pooled_per_size = std::env::var("TESSERA_POOL_MAX_PER_SIZE").ok().and_then(|s| s.parse().ok());

        Self { allow_gpu, leasing, pool_policy, max_pooled_per_size }
    }
}
