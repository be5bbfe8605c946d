//! Elementwise fusion front-end.
//!
//! Operators are written as ordinary Rust closures over [`Expr`] placeholders and recorded as small
//! expression trees:
//!
//! ```ignore
//! let add = BinaryLambda::new(|acc, x| acc + x);
//! let mul = BinaryLambda::new(|acc, x| acc * x);
//!
//! // out[i] = (a[i] + b[i]) * c[i], in one launch
//! let fused = rt.fuse(&[add, mul])?;
//! let out = fused.call(&rt, &a, &[&b, &c])?;
//! ```
//!
//! [`ComputeRuntime::fuse`](crate::ComputeRuntime::fuse) accepts only bodies that are a single
//! binary operator applied to the two parameters. Anything else can still be loaded as an ordinary
//! kernel through [`ComputeRuntime::load_binary`](crate::ComputeRuntime::load_binary).

use std::fmt;
use std::ops;
use std::sync::Arc;

use smallvec::SmallVec;
use snafu::ensure;
use tessera_device::{BinaryOp, Buffer, FusedStep, HostKernel, ParamKind, Slot};

use crate::dispatch::{CallArg, CallArgList, KernelTable};
use crate::error::{InvalidArgumentSnafu, Result, UnsupportedExpressionSnafu};
use crate::runtime::ComputeRuntime;

/// Node of an operator expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Lambda parameter: 0 is the accumulator, 1 the operand.
    Param(usize),
    Const(f32),
    Binary { op: BinaryOp, lhs: Arc<Expr>, rhs: Arc<Expr> },
    Neg(Arc<Expr>),
    /// Named elementwise function such as `exp`.
    Call { method: String, args: Vec<Expr> },
}

impl Expr {
    pub fn param(index: usize) -> Self {
        Expr::Param(index)
    }

    pub fn constant(value: f32) -> Self {
        Expr::Const(value)
    }

    pub fn call(method: impl Into<String>, args: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Call { method: method.into(), args: args.into_iter().collect() }
    }

    pub fn exp(self) -> Self {
        Self::call("exp", [self])
    }

    pub fn sqrt(self) -> Self {
        Self::call("sqrt", [self])
    }

    pub fn abs(self) -> Self {
        Self::call("abs", [self])
    }

    pub fn max(self, other: Expr) -> Self {
        Self::call("max", [self, other])
    }

    pub fn min(self, other: Expr) -> Self {
        Self::call("min", [self, other])
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary { op, lhs: Arc::new(lhs), rhs: Arc::new(rhs) }
    }

    /// Reject trees the interpreter cannot evaluate.
    fn validate(&self) -> Result<()> {
        match self {
            Expr::Param(index) => {
                ensure!(*index < 2, UnsupportedExpressionSnafu { reason: format!("parameter {index} out of range") });
                Ok(())
            }
            Expr::Const(_) => Ok(()),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.validate()?;
                rhs.validate()
            }
            Expr::Neg(inner) => inner.validate(),
            Expr::Call { method, args } => {
                let arity = match method.as_str() {
                    "exp" | "sqrt" | "abs" => 1,
                    "max" | "min" => 2,
                    _ => return UnsupportedExpressionSnafu { reason: format!("unknown method '{method}'") }.fail(),
                };
                ensure!(
                    args.len() == arity,
                    UnsupportedExpressionSnafu {
                        reason: format!("'{method}' takes {arity} arguments, got {}", args.len())
                    }
                );
                args.iter().try_for_each(Expr::validate)
            }
        }
    }

    /// Evaluate a validated tree.
    fn eval(&self, params: [f32; 2]) -> f32 {
        match self {
            Expr::Param(index) => params[*index],
            Expr::Const(value) => *value,
            Expr::Binary { op, lhs, rhs } => op.apply(lhs.eval(params), rhs.eval(params)),
            Expr::Neg(inner) => -inner.eval(params),
            Expr::Call { method, args } => {
                let arg = |i: usize| args[i].eval(params);
                match method.as_str() {
                    "exp" => arg(0).exp(),
                    "sqrt" => arg(0).sqrt(),
                    "abs" => arg(0).abs(),
                    "max" => arg(0).max(arg(1)),
                    "min" => arg(0).min(arg(1)),
                    _ => f32::NAN,
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Param(0) => f.write_str("x"),
            Expr::Param(1) => f.write_str("y"),
            Expr::Param(index) => write!(f, "p{index}"),
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Binary { op, lhs, rhs } => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Rem => "%",
                };
                write!(f, "({lhs} {symbol} {rhs})")
            }
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Call { method, args } => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{method}({})", args.join(", "))
            }
        }
    }
}

macro_rules! impl_binary_ops {
    ($($trait:ident::$method:ident => $op:ident),+ $(,)?) => {$(
        impl ops::$trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl ops::$trait<f32> for Expr {
            type Output = Expr;

            fn $method(self, rhs: f32) -> Expr {
                Expr::binary(BinaryOp::$op, self, Expr::Const(rhs))
            }
        }

        impl ops::$trait<Expr> for f32 {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, Expr::Const(self), rhs)
            }
        }
    )+};
}

impl_binary_ops! {
    Add::add => Add,
    Sub::sub => Sub,
    Mul::mul => Mul,
    Div::div => Div,
    Rem::rem => Rem,
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Neg(Arc::new(self))
    }
}

/// Recorded `(accumulator, operand) -> accumulator` operator.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryLambda {
    body: Expr,
}

impl BinaryLambda {
    /// Record `f` by applying it to the two parameter placeholders.
    pub fn new(f: impl FnOnce(Expr, Expr) -> Expr) -> Self {
        Self { body: f(Expr::Param(0), Expr::Param(1)) }
    }

    pub fn from_body(body: Expr) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Expr {
        &self.body
    }

    /// Lower to a fused step. Only `param <op> param` bodies qualify.
    pub fn to_step(&self) -> Result<FusedStep> {
        let Expr::Binary { op, lhs, rhs } = &self.body else {
            return UnsupportedExpressionSnafu { reason: format!("'{}' is not a binary operator", self.body) }.fail();
        };
        let slot = |expr: &Expr| match expr {
            Expr::Param(0) => Ok(Slot::Accumulator),
            Expr::Param(1) => Ok(Slot::Operand),
            other => UnsupportedExpressionSnafu {
                reason: format!("operand '{other}' of '{}' is not a lambda parameter", self.body),
            }
            .fail(),
        };
        Ok(FusedStep::new(*op, slot(lhs)?, slot(rhs)?))
    }

    /// Interpreted elementwise kernel with signature `(out, a, b)`.
    pub fn to_host_kernel(&self) -> Result<HostKernel> {
        self.body.validate()?;
        let body = self.body.clone();
        let name = format!("lambda {}", self.body);
        Ok(HostKernel::new(name, [ParamKind::Buffer; 3], move |lane| {
            lane.store(0, body.eval([lane.load(1), lane.load(2)]))
        }))
    }
}

/// Freshly compiled single-pass kernel for a chain of operators.
///
/// Takes `(out, initial, operand_1, .., operand_n)`.
#[derive(Debug, Clone)]
pub struct FusedKernel {
    table: KernelTable,
    operands: usize,
}

impl FusedKernel {
    pub(crate) fn new(table: KernelTable, operands: usize) -> Self {
        Self { table, operands }
    }

    pub fn table(&self) -> &KernelTable {
        &self.table
    }

    /// Number of operand buffers expected after `initial`.
    pub fn operand_count(&self) -> usize {
        self.operands
    }

    /// Apply the fused chain to `initial` and `operands` into a new buffer on `initial`'s accelerator.
    pub fn call(&self, rt: &ComputeRuntime, initial: &Buffer, operands: &[&Buffer]) -> Result<Buffer> {
        self.check_operands(operands)?;
        let out = rt.get(initial.accelerator(), initial.len())?;
        rt.vend_or_return(out, |out| self.call_into(rt, out, initial, operands))
    }

    /// Like [`FusedKernel::call`] but writes into `out`, which may alias `initial`.
    pub fn call_into(&self, rt: &ComputeRuntime, out: &Buffer, initial: &Buffer, operands: &[&Buffer]) -> Result<()> {
        self.check_operands(operands)?;
        let mut args: CallArgList<'_> = SmallVec::with_capacity(operands.len() + 2);
        args.push(CallArg::Buffer(out));
        args.push(CallArg::Buffer(initial));
        args.extend(operands.iter().map(|&operand| CallArg::Buffer(operand)));
        rt.call(initial.accelerator(), &self.table, args)
    }

    fn check_operands(&self, operands: &[&Buffer]) -> Result<()> {
        ensure!(
            operands.len() == self.operands,
            InvalidArgumentSnafu {
                reason: format!(
                    "fused kernel '{}' takes {} operands, got {}",
                    self.table.name(),
                    self.operands,
                    operands.len()
                )
            }
        );
        Ok(())
    }
}
