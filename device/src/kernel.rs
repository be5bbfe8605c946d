//! Kernel descriptors and compiled programs.
//!
//! A [`KernelSource`] describes a data-parallel function:
//! - [`HostKernel`]: an opaque elementwise body supplied by the caller
//! - [`FusedPlan`]: a short chain of binary operators synthesized by the fusion front-end
//!
//! A device compiler lowers either form into a [`Program`] that executes over an index range.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use smallvec::SmallVec;
use snafu::ensure;

use crate::buffer::RawBuffer;
use crate::error::{
    ArgumentCountSnafu, ArgumentKindSnafu, ArgumentLengthSnafu, InvalidPlanSnafu, MissingRangeSnafu, Result,
};

/// Upper bound on operator expressions folded into one fused kernel.
pub const MAX_FUSED_STEPS: usize = 3;

/// Kind of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Buffer,
    Scalar,
}

/// Argument bound to one kernel parameter at launch time.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(Arc<RawBuffer>),
    Scalar(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ParamKind {
        match self {
            KernelArg::Buffer(_) => ParamKind::Buffer,
            KernelArg::Scalar(_) => ParamKind::Scalar,
        }
    }
}

pub type KernelArgs = SmallVec<[KernelArg; 8]>;
pub type KernelParams = SmallVec<[ParamKind; 8]>;

/// Check `args` against `params` and derive the launch range.
///
/// The range covers every element of the first buffer argument; all other buffers must be at least
/// that long.
pub fn launch_range(kernel: &str, params: &[ParamKind], args: &[KernelArg]) -> Result<Range<usize>> {
    ensure!(
        params.len() == args.len(),
        ArgumentCountSnafu { kernel, expected: params.len(), actual: args.len() }
    );
    for (index, (expected, arg)) in params.iter().zip(args).enumerate() {
        let actual = arg.kind();
        ensure!(*expected == actual, ArgumentKindSnafu { kernel, index, expected: *expected, actual });
    }

    let mut buffers = args.iter().enumerate().filter_map(|(index, arg)| match arg {
        KernelArg::Buffer(raw) => Some((index, raw.len())),
        KernelArg::Scalar(_) => None,
    });
    let Some((_, len)) = buffers.next() else {
        return MissingRangeSnafu { kernel }.fail();
    };
    for (index, actual) in buffers {
        ensure!(actual >= len, ArgumentLengthSnafu { kernel, index, expected: len, actual });
    }
    Ok(0..len)
}

/// One lane of a data-parallel launch.
///
/// A lane reads and writes only its own element of every buffer argument, which keeps lanes
/// independent of each other even when the output aliases an input.
pub struct Lane<'a> {
    index: usize,
    args: &'a [KernelArg],
}

impl<'a> Lane<'a> {
    /// Build a lane; `index` should lie inside the range returned by [`launch_range`] for `args`.
    pub(crate) fn new(index: usize, args: &'a [KernelArg]) -> Self {
        Self { index, args }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Element of buffer argument `slot` at this lane; scalar arguments are broadcast.
    pub fn load(&self, slot: usize) -> f32 {
        match self.args.get(slot) {
            // SAFETY: index is in bounds.
            Some(KernelArg::Buffer(raw)) if self.index < raw.len() => unsafe { raw.as_ptr().add(self.index).read() },
            Some(KernelArg::Scalar(value)) => *value,
            _ => {
                debug_assert!(false, "lane {} read outside argument {slot}", self.index);
                0.0
            }
        }
    }

    /// Scalar argument `slot`.
    pub fn scalar(&self, slot: usize) -> f32 {
        self.load(slot)
    }

    /// Write this lane's element of buffer argument `slot`.
    pub fn store(&self, slot: usize, value: f32) {
        match self.args.get(slot) {
            // SAFETY: index is in bounds and no other lane touches this element.
            Some(KernelArg::Buffer(raw)) if self.index < raw.len() => unsafe {
                raw.as_ptr().add(self.index).write(value);
            },
            _ => debug_assert!(false, "lane {} wrote outside argument {slot}", self.index),
        }
    }
}

pub type HostBody = Arc<dyn Fn(&Lane<'_>) + Send + Sync>;

/// Opaque elementwise function executed once per lane.
#[derive(Clone)]
pub struct HostKernel {
    name: String,
    params: KernelParams,
    body: HostBody,
}

impl HostKernel {
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamKind>,
        body: impl Fn(&Lane<'_>) + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), params: params.into_iter().collect(), body: Arc::new(body) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn body(&self) -> &HostBody {
        &self.body
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel").field("name", &self.name).field("params", &self.params).finish()
    }
}

/// Binary operator tags shared by every compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Rem => lhs % rhs,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
        }
    }
}

/// Input of a fused step: the running accumulator or the step's own operand buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Accumulator,
    Operand,
}

/// `accumulator = lhs <op> rhs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FusedStep {
    pub op: BinaryOp,
    pub lhs: Slot,
    pub rhs: Slot,
}

impl FusedStep {
    pub fn new(op: BinaryOp, lhs: Slot, rhs: Slot) -> Self {
        Self { op, lhs, rhs }
    }
}

/// Chain of fused steps.
///
/// The compiled kernel takes `(out, initial, operand_1, .., operand_n)`, seeds the accumulator
/// from `initial` and applies step `k` with `operand_k`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FusedPlan {
    steps: SmallVec<[FusedStep; MAX_FUSED_STEPS]>,
}

impl FusedPlan {
    pub fn new(steps: impl IntoIterator<Item = FusedStep>) -> Result<Self> {
        let steps: SmallVec<[FusedStep; MAX_FUSED_STEPS]> = steps.into_iter().collect();
        ensure!((1..=MAX_FUSED_STEPS).contains(&steps.len()), InvalidPlanSnafu { steps: steps.len() });
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[FusedStep] {
        &self.steps
    }

    pub fn operand_count(&self) -> usize {
        self.steps.len()
    }

    pub fn params(&self) -> KernelParams {
        std::iter::repeat_n(ParamKind::Buffer, self.steps.len() + 2).collect()
    }

    pub fn name(&self) -> String {
        let ops: Vec<&str> = self.steps.iter().map(|step| step.op.name()).collect();
        format!("fused_{}", ops.join("_"))
    }
}

/// Function descriptor handed to a device compiler.
#[derive(Debug, Clone)]
pub enum KernelSource {
    Host(HostKernel),
    Fused(FusedPlan),
}

impl KernelSource {
    pub fn name(&self) -> String {
        match self {
            KernelSource::Host(kernel) => kernel.name().to_string(),
            KernelSource::Fused(plan) => plan.name(),
        }
    }

    pub fn params(&self) -> KernelParams {
        match self {
            KernelSource::Host(kernel) => kernel.params().iter().copied().collect(),
            KernelSource::Fused(plan) => plan.params(),
        }
    }
}

impl From<HostKernel> for KernelSource {
    fn from(kernel: HostKernel) -> Self {
        KernelSource::Host(kernel)
    }
}

impl From<FusedPlan> for KernelSource {
    fn from(plan: FusedPlan) -> Self {
        KernelSource::Fused(plan)
    }
}

/// A compiled, executable kernel for one device.
pub trait Program: Send + Sync + fmt::Debug {
    /// Kernel name (for logging).
    fn name(&self) -> &str;

    /// Parameter signature.
    fn params(&self) -> &[ParamKind];

    /// Run the kernel over `range`.
    ///
    /// # Safety
    ///
    /// Nothing else may access the buffer arguments until the call returns. Streams guarantee this
    /// by running one command at a time over buffers bound to them.
    unsafe fn execute(&self, args: &[KernelArg], range: Range<usize>) -> Result<()>;
}
