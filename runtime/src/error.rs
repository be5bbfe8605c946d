//! Error types for the compute runtime.

use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by [`ComputeRuntime`](crate::ComputeRuntime) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device layer error.
    #[snafu(display("Device error: {source}"))]
    Device { source: tessera_device::Error },

    /// A caller-supplied argument is out of its domain.
    #[snafu(display("Invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// No accelerator can be leased.
    #[snafu(display("Resource exhausted: {reason}"))]
    ResourceExhausted { reason: String },

    /// Accelerator index out of range.
    #[snafu(display("Accelerator {index} not found ({count} available)"))]
    DeviceNotFound { index: usize, count: usize },

    /// Fusion was given an expression it cannot lower.
    #[snafu(display("Unsupported expression: {reason}"))]
    UnsupportedExpression { reason: String },

    /// Accelerated library unavailable on a device.
    #[snafu(display("Backend unavailable on {device}: {reason}"))]
    BackendUnavailable { device: String, reason: String },

    /// A buffer was passed to an accelerator that does not own it.
    #[snafu(display("Argument {argument} belongs to {owner}, not {target}"))]
    ForeignBuffer { argument: usize, owner: String, target: String },

    /// A kernel table compiled before the last device refresh.
    #[snafu(display("Kernel '{kernel}' was loaded for an older device generation"))]
    StaleKernel { kernel: String },
}
