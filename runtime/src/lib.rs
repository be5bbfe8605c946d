//! Compute runtime for tessera.
//!
//! Manages accelerators discovered through a [`Backend`](tessera_device::Backend): leasing, pooled
//! device buffers with deferred returns, kernel dispatch by accelerator index and a small fusion JIT
//! for chains of elementwise operators.
//!
//! # Buffer reuse
//!
//! Buffers come from a per-accelerator pool keyed by element count. Every command for one
//! accelerator runs in submission order on its stream, so a buffer may be returned (or flushed) as
//! soon as the last command using it has been *submitted*; a later `get` queues its zero fill behind
//! those commands.
//!
//! # Fusion
//!
//! [`ComputeRuntime::fuse`] turns up to three `(accumulator, operand)` operators into one kernel that
//! makes a single pass over its inputs. It equals [`ComputeRuntime::binary_call_chain`] over the same
//! operators, with one launch instead of one per operator.

pub mod accelerator;
pub mod config;
pub mod device_registry;
pub mod dispatch;
pub mod error;
pub mod fusion;
pub mod kernels;
pub mod lease;
pub mod runtime;


pub use accelerator::Accelerator;
pub use config::RuntimeConfig;
pub use dispatch::{CallArg, CallArgList, CallArgs, IntoCallArg, KernelTable};
pub use error::*;
pub use fusion::{BinaryLambda, Expr, FusedKernel};
pub use lease::LeasePolicy;
pub use runtime::{ComputeRuntime, Lease};
pub use tessera_device::{Buffer, DeviceInfo, DeviceKind, HostBackend, PoolPolicy, PoolStats};
