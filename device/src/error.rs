use snafu::Snafu;

use crate::kernel::ParamKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Buffers must hold at least one element.
    #[snafu(display("invalid buffer size: {size}"))]
    InvalidBufferSize { size: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// The device allocator refused the request.
    #[snafu(display("allocation of {size} elements on {device} failed: {reason}"))]
    Allocation { device: String, size: usize, reason: String },

    /// Optional accelerated library could not be initialized for a device.
    #[snafu(display("accelerated library unavailable on {device}: {reason}"))]
    BackendUnavailable { device: String, reason: String },

    #[snafu(display("kernel '{kernel}' expects {expected} arguments, got {actual}"))]
    ArgumentCount { kernel: String, expected: usize, actual: usize },

    #[snafu(display("kernel '{kernel}' argument {index}: expected {expected:?}, got {actual:?}"))]
    ArgumentKind { kernel: String, index: usize, expected: ParamKind, actual: ParamKind },

    /// The launch range is derived from the first buffer argument.
    #[snafu(display("kernel '{kernel}' has no buffer argument to derive a launch range from"))]
    MissingRange { kernel: String },

    #[snafu(display("kernel '{kernel}' argument {index} holds {actual} elements, launch range needs {expected}"))]
    ArgumentLength { kernel: String, index: usize, expected: usize, actual: usize },

    /// A fused plan must hold between one and `MAX_FUSED_STEPS` steps.
    #[snafu(display("invalid fused plan with {steps} steps"))]
    InvalidPlan { steps: usize },

    /// A previously submitted command failed on the device.
    #[snafu(display("command stream of {device} faulted: {reason}"))]
    StreamFault { device: String, reason: String },

    /// Buffers stay with the stream that first used them.
    #[snafu(display("buffer of {len} elements belongs to another command stream than {device}'s"))]
    ForeignStream { device: String, len: usize },

    #[snafu(display("command stream of {device} is closed"))]
    StreamClosed { device: String },

    #[snafu(display("{message}"))]
    Runtime { message: String },
}
