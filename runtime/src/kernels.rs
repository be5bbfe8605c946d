//! Reference elementwise kernels for the host backend.
//!
//! Every kernel writes argument 0 and reads the rest, so `(out, a, b)` for binary operators and
//! `(out, a)` for unary ones. They fit [`ComputeRuntime::unary_call`](crate::ComputeRuntime::unary_call),
//! [`ComputeRuntime::binary_call`](crate::ComputeRuntime::binary_call) and chains.

use tessera_device::HostKernel;
use tessera_device::ParamKind::{Buffer, Scalar};

fn unary(name: &str, f: fn(f32) -> f32) -> HostKernel {
    HostKernel::new(name, [Buffer, Buffer], move |lane| lane.store(0, f(lane.load(1))))
}

fn binary(name: &str, f: fn(f32, f32) -> f32) -> HostKernel {
    HostKernel::new(name, [Buffer, Buffer, Buffer], move |lane| lane.store(0, f(lane.load(1), lane.load(2))))
}

pub fn add() -> HostKernel {
    binary("add", |a, b| a + b)
}

pub fn sub() -> HostKernel {
    binary("sub", |a, b| a - b)
}

pub fn mul() -> HostKernel {
    binary("mul", |a, b| a * b)
}

pub fn div() -> HostKernel {
    binary("div", |a, b| a / b)
}

pub fn neg() -> HostKernel {
    unary("neg", |a| -a)
}

pub fn exp() -> HostKernel {
    unary("exp", f32::exp)
}

pub fn sqrt() -> HostKernel {
    unary("sqrt", f32::sqrt)
}

/// `(out, a, s)`: `out = a * s`
pub fn scale() -> HostKernel {
    HostKernel::new("scale", [Buffer, Buffer, Scalar], |lane| lane.store(0, lane.load(1) * lane.scalar(2)))
}

/// `(out, x, y, alpha)`: `out = alpha * x + y`
pub fn axpy() -> HostKernel {
    HostKernel::new("axpy", [Buffer, Buffer, Buffer, Scalar], |lane| {
        lane.store(0, lane.scalar(3).mul_add(lane.load(1), lane.load(2)))
    })
}
