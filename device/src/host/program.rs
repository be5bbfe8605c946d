//! Host kernel compiler.
//!
//! Host kernels run their body once per lane on the rayon pool. Fused plans are lowered into a
//! single per-lane closure: every step becomes one monomorphic operator composed onto the previous
//! stage, so one launch reads each input once and writes the output once.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::Result;
use crate::kernel::{
    BinaryOp, FusedPlan, FusedStep, HostKernel, KernelArg, KernelParams, KernelSource, Lane, MAX_FUSED_STEPS,
    ParamKind, Program, Slot, launch_range,
};

/// Lanes below this count stay on one worker.
const MIN_LANES_PER_TASK: usize = 4096;

/// Compile `source` for the host.
pub fn compile(source: &KernelSource) -> Arc<dyn Program> {
    match source {
        KernelSource::Host(kernel) => Arc::new(HostProgram::new(kernel)),
        KernelSource::Fused(plan) => Arc::new(FusedProgram::lower(plan)),
    }
}

/// Clamp the requested range to what the arguments can hold.
fn lanes(name: &str, params: &[ParamKind], args: &[KernelArg], range: Range<usize>) -> Result<Range<usize>> {
    let valid = launch_range(name, params, args)?;
    Ok(range.start.min(valid.end)..range.end.min(valid.end))
}

fn for_each_lane(args: &[KernelArg], range: Range<usize>, body: impl Fn(&Lane<'_>) + Sync + Send) {
    range.into_par_iter().with_min_len(MIN_LANES_PER_TASK).for_each(|index| body(&Lane::new(index, args)));
}

/// Caller-supplied elementwise kernel.
#[derive(Debug)]
pub struct HostProgram {
    kernel: HostKernel,
}

impl HostProgram {
    pub fn new(kernel: &HostKernel) -> Self {
        Self { kernel: kernel.clone() }
    }
}

impl Program for HostProgram {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn params(&self) -> &[ParamKind] {
        self.kernel.params()
    }

    unsafe fn execute(&self, args: &[KernelArg], range: Range<usize>) -> Result<()> {
        let range = lanes(self.name(), self.params(), args, range)?;
        let body = self.kernel.body();
        for_each_lane(args, range, |lane| body(lane));
        Ok(())
    }
}

/// Per-lane function of a fused plan: `(initial, operands) -> result`.
type Stage = Box<dyn Fn(f32, &[f32]) -> f32 + Send + Sync>;

/// Single-pass kernel lowered from a [`FusedPlan`].
pub struct FusedProgram {
    name: String,
    params: KernelParams,
    operands: usize,
    stage: Stage,
}

impl FusedProgram {
    pub fn lower(plan: &FusedPlan) -> Self {
        let mut stage: Stage = Box::new(|initial, _| initial);
        for (k, step) in plan.steps().iter().copied().enumerate() {
            stage = lower_step(stage, step, k);
        }
        Self { name: plan.name(), params: plan.params(), operands: plan.operand_count(), stage }
    }

    /// Evaluate the fused expression for one lane's inputs.
    pub fn evaluate(&self, initial: f32, operands: &[f32]) -> f32 {
        (self.stage)(initial, operands)
    }
}

fn lower_step(prev: Stage, step: FusedStep, k: usize) -> Stage {
    let op = operator(step.op);
    match (step.lhs, step.rhs) {
        (Slot::Accumulator, Slot::Operand) => Box::new(move |initial, operands| {
            op(prev(initial, operands), operands[k])
        }),
        (Slot::Operand, Slot::Accumulator) => Box::new(move |initial, operands| {
            op(operands[k], prev(initial, operands))
        }),
        (Slot::Accumulator, Slot::Accumulator) => Box::new(move |initial, operands| {
            let acc = prev(initial, operands);
            op(acc, acc)
        }),
        // The step discards the accumulator, so earlier stages need not run.
        (Slot::Operand, Slot::Operand) => Box::new(move |_, operands| op(operands[k], operands[k])),
    }
}

fn operator(op: BinaryOp) -> fn(f32, f32) -> f32 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
        BinaryOp::Rem => |a, b| a % b,
    }
}

impl Program for FusedProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[ParamKind] {
        &self.params
    }

    unsafe fn execute(&self, args: &[KernelArg], range: Range<usize>) -> Result<()> {
        let range = lanes(&self.name, &self.params, args, range)?;
        let count = self.operands;
        for_each_lane(args, range, |lane| {
            let mut operands = [0.0f32; MAX_FUSED_STEPS];
            for (k, value) in operands.iter_mut().take(count).enumerate() {
                *value = lane.load(k + 2);
            }
            lane.store(0, self.evaluate(lane.load(1), &operands[..count]));
        });
        Ok(())
    }
}

impl fmt::Debug for FusedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusedProgram").field("name", &self.name).field("operands", &self.operands).finish()
    }
}
