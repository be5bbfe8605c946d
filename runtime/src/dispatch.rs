//! Kernel tables and call arguments.
//!
//! A [`KernelTable`] holds one compiled program per accelerator. Arguments are passed as a tuple of
//! buffers and scalars (or any other [`CallArgs`]), which gives every kernel signature the same
//! call path:
//!
//! ```ignore
//! let add = rt.load(kernels::add())?;
//! rt.call(0, &add, (&out, &a, &b))?;
//! rt.call(0, &scale, (&out, &a, 0.5f32))?;
//! ```

use std::fmt;
use std::sync::Arc;

use smallvec::{SmallVec, smallvec};
use tessera_device::{Buffer, KernelParams, ParamKind, Program};

/// Compiled programs of one kernel, indexed by accelerator.
#[derive(Clone)]
pub struct KernelTable {
    name: String,
    params: KernelParams,
    generation: u64,
    entries: Vec<Arc<dyn Program>>,
}

impl KernelTable {
    pub(crate) fn new(
        name: impl Into<String>,
        params: KernelParams,
        generation: u64,
        entries: Vec<Arc<dyn Program>>,
    ) -> Self {
        Self { name: name.into(), params, generation, entries }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Device generation the table was compiled for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of accelerators the table was compiled for.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Program compiled for accelerator `index`.
    pub fn entry(&self, index: usize) -> Option<&Arc<dyn Program>> {
        self.entries.get(index)
    }
}

impl fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTable")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("generation", &self.generation)
            .field("accelerators", &self.entries.len())
            .finish()
    }
}

/// One argument of a kernel call.
#[derive(Debug, Clone, Copy)]
pub enum CallArg<'a> {
    Buffer(&'a Buffer),
    Scalar(f32),
}

pub type CallArgList<'a> = SmallVec<[CallArg<'a>; 8]>;

pub trait IntoCallArg<'a> {
    fn into_call_arg(self) -> CallArg<'a>;
}

impl<'a> IntoCallArg<'a> for &'a Buffer {
    fn into_call_arg(self) -> CallArg<'a> {
        CallArg::Buffer(self)
    }
}

impl<'a> IntoCallArg<'a> for f32 {
    fn into_call_arg(self) -> CallArg<'a> {
        CallArg::Scalar(self)
    }
}

impl<'a> IntoCallArg<'a> for CallArg<'a> {
    fn into_call_arg(self) -> CallArg<'a> {
        self
    }
}

/// Argument list of a kernel call, in parameter order.
pub trait CallArgs<'a> {
    fn into_call_args(self) -> CallArgList<'a>;
}

impl<'a> CallArgs<'a> for CallArgList<'a> {
    fn into_call_args(self) -> CallArgList<'a> {
        self
    }
}

impl<'a> CallArgs<'a> for Vec<CallArg<'a>> {
    fn into_call_args(self) -> CallArgList<'a> {
        self.into_iter().collect()
    }
}

impl<'a> CallArgs<'a> for &[CallArg<'a>] {
    fn into_call_args(self) -> CallArgList<'a> {
        self.iter().copied().collect()
    }
}

macro_rules! impl_call_args {
    ($($arg:ident),+) => {
        impl<'a, $($arg: IntoCallArg<'a>),+> CallArgs<'a> for ($($arg,)+) {
            #[allow(non_snake_case)]
            fn into_call_args(self) -> CallArgList<'a> {
                let ($($arg,)+) = self;
                smallvec![$($arg.into_call_arg()),+]
            }
        }
    };
}

impl_call_args!(A);
impl_call_args!(A, B);
impl_call_args!(A, B, C);
impl_call_args!(A, B, C, D);
impl_call_args!(A, B, C, D, E);
impl_call_args!(A, B, C, D, E, F);
impl_call_args!(A, B, C, D, E, F, G);
impl_call_args!(A, B, C, D, E, F, G, H);
impl_call_args!(A, B, C, D, E, F, G, H, I);
impl_call_args!(A, B, C, D, E, F, G, H, I, J);
impl_call_args!(A, B, C, D, E, F, G, H, I, J, K);
