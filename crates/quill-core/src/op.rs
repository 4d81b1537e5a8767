use std::sync::atomic::{AtomicU64, Ordering};

use crate::array::Array;
use crate::kernel::{BinaryOp, CmpOp, ReduceOp, UnaryOp};

// Op — the recorded trace graph
//
// Every Array remembers the operation that produced it. Since ops hold
// Arc-cloned input Arrays, the arrays of one computation form a DAG
// rooted at the inputs; backprop walks it in reverse and the JIT trace
// flattens it into a plan. Arrays created from host data carry Op::None
// and terminate the walk.

/// Unique identifier for an array, used as the key in gradient maps and
/// plan slot resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(u64);

impl ArrayId {
    /// A fresh process-unique id.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ArrayId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a functional `update` writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Index {
    /// A single element addressed by its full coordinates.
    At(Vec<usize>),
    /// A contiguous run along one dimension.
    Slice { dim: usize, start: usize, len: usize },
}

/// The operation that produced an array.
#[derive(Debug, Clone)]
pub enum Op {
    /// Leaf: created from host data or a constructor, nothing to trace.
    None,
    Binary(BinaryOp, Array, Array),
    Unary(UnaryOp, Array),
    Reduce(ReduceOp, Array, Vec<usize>, bool),
    Matmul(Array, Array),
    Reshape(Array),
    Transpose(Array, usize, usize),
    Narrow {
        input: Array,
        dim: usize,
        start: usize,
        len: usize,
    },
    Broadcast(Array),
    Stack(Vec<Array>, usize),
    /// Functional write: a copy of `input` with `values` placed at `index`.
    Update {
        input: Array,
        values: Array,
        index: Index,
    },
    WhereCond {
        mask: Array,
        on_true: Array,
        on_false: Array,
    },
    Powf(Array, f64),
    Affine(Array, f64, f64),
    Cast(Array),
    /// Comparisons produce Bool arrays; no gradient flows through them.
    Cmp(CmpOp, Array, Array),
    /// Device transfer; gradients pass through unchanged.
    Transfer(Array),
}

impl Op {
    /// The input arrays of this operation, in a fixed order.
    pub fn inputs(&self) -> Vec<&Array> {
        match self {
            Op::None => vec![],
            Op::Binary(_, lhs, rhs) => vec![lhs, rhs],
            Op::Unary(_, a)
            | Op::Reduce(_, a, _, _)
            | Op::Reshape(a)
            | Op::Transpose(a, _, _)
            | Op::Broadcast(a)
            | Op::Powf(a, _)
            | Op::Affine(a, _, _)
            | Op::Cast(a)
            | Op::Transfer(a) => vec![a],
            Op::Narrow { input, .. } => vec![input],
            Op::Matmul(lhs, rhs) => vec![lhs, rhs],
            Op::Stack(inputs, _) => inputs.iter().collect(),
            Op::Update { input, values, .. } => vec![input, values],
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => vec![mask, on_true, on_false],
            Op::Cmp(_, lhs, rhs) => vec![lhs, rhs],
        }
    }

    /// Short operation name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "leaf",
            Op::Binary(BinaryOp::Add, _, _) => "add",
            Op::Binary(BinaryOp::Sub, _, _) => "sub",
            Op::Binary(BinaryOp::Mul, _, _) => "mul",
            Op::Binary(BinaryOp::Div, _, _) => "div",
            Op::Unary(UnaryOp::Neg, _) => "neg",
            Op::Unary(UnaryOp::Abs, _) => "abs",
            Op::Unary(UnaryOp::Exp, _) => "exp",
            Op::Unary(UnaryOp::Log, _) => "log",
            Op::Unary(UnaryOp::Sqrt, _) => "sqrt",
            Op::Unary(UnaryOp::Square, _) => "square",
            Op::Unary(UnaryOp::Sin, _) => "sin",
            Op::Unary(UnaryOp::Cos, _) => "cos",
            Op::Unary(UnaryOp::Tanh, _) => "tanh",
            Op::Reduce(ReduceOp::Sum, _, _, _) => "sum",
            Op::Reduce(ReduceOp::Mean, _, _, _) => "mean",
            Op::Reduce(ReduceOp::Max, _, _, _) => "max",
            Op::Reduce(ReduceOp::Min, _, _, _) => "min",
            Op::Matmul(_, _) => "matmul",
            Op::Reshape(_) => "reshape",
            Op::Transpose(_, _, _) => "transpose",
            Op::Narrow { .. } => "narrow",
            Op::Broadcast(_) => "broadcast",
            Op::Stack(_, _) => "stack",
            Op::Update { .. } => "update",
            Op::WhereCond { .. } => "where_cond",
            Op::Powf(_, _) => "powf",
            Op::Affine(_, _, _) => "affine",
            Op::Cast(_) => "cast",
            Op::Cmp(_, _, _) => "cmp",
            Op::Transfer(_) => "transfer",
        }
    }
}
