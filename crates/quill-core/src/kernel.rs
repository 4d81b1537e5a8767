use rayon::prelude::*;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::storage::Buffer;

// Kernels — CPU implementations of every primitive operation
//
// All kernels take buffer + layout (the layout encodes broadcasting,
// transposition, and slicing via strides) and return a fresh contiguous
// buffer. Nothing here mutates its inputs.
//
// Arithmetic is computed through f64 and converted back via WithDType.
// For the dtype set supported here (f32/f64/i32/i64/bool) f64 holds every
// value exactly except large i64, which is out of scope for a library
// whose integer arrays carry indices and labels.

/// Elementwise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tanh,
}

/// Reduction operations along dimension(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Comparison operations (produce Bool arrays).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

impl UnaryOp {
    fn apply(self, v: f64) -> f64 {
        match self {
            UnaryOp::Neg => -v,
            UnaryOp::Abs => v.abs(),
            UnaryOp::Exp => v.exp(),
            UnaryOp::Log => v.ln(),
            UnaryOp::Sqrt => v.sqrt(),
            UnaryOp::Square => v * v,
            UnaryOp::Sin => v.sin(),
            UnaryOp::Cos => v.cos(),
            UnaryOp::Tanh => v.tanh(),
        }
    }
}

impl CmpOp {
    fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

fn map1<T: WithDType>(a: &[T], la: &Layout, f: impl Fn(f64) -> f64) -> Vec<T> {
    la.strided_indices()
        .map(|i| T::from_f64(f(a[i].to_f64())))
        .collect()
}

fn map2<T: WithDType>(
    a: &[T],
    la: &Layout,
    b: &[T],
    lb: &Layout,
    f: impl Fn(f64, f64) -> f64,
) -> Vec<T> {
    la.strided_indices()
        .zip(lb.strided_indices())
        .map(|(i, j)| T::from_f64(f(a[i].to_f64(), b[j].to_f64())))
        .collect()
}

macro_rules! dispatch1 {
    ($buf:expr, $layout:expr, $f:expr) => {
        match $buf {
            Buffer::F32(v) => Buffer::F32(map1(v, $layout, $f)),
            Buffer::F64(v) => Buffer::F64(map1(v, $layout, $f)),
            Buffer::I32(v) => Buffer::I32(map1(v, $layout, $f)),
            Buffer::I64(v) => Buffer::I64(map1(v, $layout, $f)),
            Buffer::Bool(v) => Buffer::Bool(map1(v, $layout, $f)),
        }
    };
}

/// Apply a binary op elementwise. Both layouts must already describe the
/// same (broadcast) output shape; dtypes must match.
pub fn binary(
    op: BinaryOp,
    lhs: &Buffer,
    lhs_layout: &Layout,
    rhs: &Buffer,
    rhs_layout: &Layout,
) -> Result<Buffer> {
    let f = |a, b| op.apply(a, b);
    let out = match (lhs, rhs) {
        (Buffer::F32(a), Buffer::F32(b)) => Buffer::F32(map2(a, lhs_layout, b, rhs_layout, f)),
        (Buffer::F64(a), Buffer::F64(b)) => Buffer::F64(map2(a, lhs_layout, b, rhs_layout, f)),
        (Buffer::I32(a), Buffer::I32(b)) => Buffer::I32(map2(a, lhs_layout, b, rhs_layout, f)),
        (Buffer::I64(a), Buffer::I64(b)) => Buffer::I64(map2(a, lhs_layout, b, rhs_layout, f)),
        _ => {
            return Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            })
        }
    };
    Ok(out)
}

/// Apply a unary op elementwise.
pub fn unary(op: UnaryOp, input: &Buffer, layout: &Layout) -> Result<Buffer> {
    Ok(dispatch1!(input, layout, |v| op.apply(v)))
}

/// Elementwise x * mul + add (fused scale-and-shift).
pub fn affine(input: &Buffer, layout: &Layout, mul: f64, add: f64) -> Result<Buffer> {
    Ok(dispatch1!(input, layout, |v| v * mul + add))
}

/// Elementwise power with a host-constant exponent.
pub fn powf(input: &Buffer, layout: &Layout, exponent: f64) -> Result<Buffer> {
    Ok(dispatch1!(input, layout, |v| v.powf(exponent)))
}

/// Elementwise comparison; always produces a Bool buffer.
pub fn cmp(
    op: CmpOp,
    lhs: &Buffer,
    lhs_layout: &Layout,
    rhs: &Buffer,
    rhs_layout: &Layout,
) -> Result<Buffer> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    let out = lhs_layout
        .strided_indices()
        .zip(rhs_layout.strided_indices())
        .map(|(i, j)| op.apply(lhs.get_f64(i), rhs.get_f64(j)))
        .collect();
    Ok(Buffer::Bool(out))
}

/// result[i] = if mask[i] { on_true[i] } else { on_false[i] }.
/// All three layouts must describe the same output shape.
pub fn where_cond(
    mask: &Buffer,
    mask_layout: &Layout,
    on_true: &Buffer,
    on_true_layout: &Layout,
    on_false: &Buffer,
    on_false_layout: &Layout,
) -> Result<Buffer> {
    if on_true.dtype() != on_false.dtype() {
        return Err(Error::DTypeMismatch {
            expected: on_true.dtype(),
            got: on_false.dtype(),
        });
    }
    let picks: Vec<f64> = mask_layout
        .strided_indices()
        .zip(on_true_layout.strided_indices())
        .zip(on_false_layout.strided_indices())
        .map(|((m, t), f)| {
            if mask.get_f64(m) != 0.0 {
                on_true.get_f64(t)
            } else {
                on_false.get_f64(f)
            }
        })
        .collect();
    Ok(Buffer::from_f64_slice(&picks, on_true.dtype()))
}

/// Reduce along `dims` (all dims when empty). Returns the reduced buffer
/// and its shape; reduced dimensions stay as size 1 when `keep_dim`.
pub fn reduce(
    op: ReduceOp,
    input: &Buffer,
    layout: &Layout,
    dims: &[usize],
    keep_dim: bool,
) -> Result<(Buffer, Shape)> {
    let rank = layout.rank();
    let reduce_all: Vec<usize> = (0..rank).collect();
    let dims: &[usize] = if dims.is_empty() { &reduce_all } else { dims };
    for &d in dims {
        if d >= rank {
            return Err(Error::DimOutOfRange { dim: d, rank });
        }
    }
    let reduced = |d: usize| dims.contains(&d);

    // Shape with reduced dims collapsed to 1; output indices are computed
    // against this shape's contiguous strides with reduced indices pinned
    // to 0.
    let kept_dims: Vec<usize> = layout
        .dims()
        .iter()
        .enumerate()
        .map(|(d, &s)| if reduced(d) { 1 } else { s })
        .collect();
    let kept_shape = Shape::new(kept_dims);
    let kept_strides = kept_shape.stride_contiguous();
    let out_len = kept_shape.elem_count();
    let count: usize = layout
        .dims()
        .iter()
        .enumerate()
        .filter(|(d, _)| reduced(*d))
        .map(|(_, &s)| s)
        .product::<usize>()
        .max(1);

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_len];

    // Walk every logical element, folding it into its output cell.
    let mut index = vec![0usize; rank];
    for _ in 0..layout.elem_count() {
        let src = layout.flat_index(&index);
        let mut dst = 0usize;
        for d in 0..rank {
            if !reduced(d) {
                dst += index[d] * kept_strides[d];
            }
        }
        let v = input.get_f64(src);
        acc[dst] = match op {
            ReduceOp::Sum | ReduceOp::Mean => acc[dst] + v,
            ReduceOp::Max => acc[dst].max(v),
            ReduceOp::Min => acc[dst].min(v),
        };
        // Advance multi-index, rightmost dim first.
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < layout.dims()[d] {
                break;
            }
            index[d] = 0;
        }
    }

    if op == ReduceOp::Mean {
        for a in acc.iter_mut() {
            *a /= count as f64;
        }
    }

    let out_shape = if keep_dim {
        kept_shape
    } else {
        Shape::new(
            layout
                .dims()
                .iter()
                .enumerate()
                .filter(|(d, _)| !reduced(*d))
                .map(|(_, &s)| s)
                .collect(),
        )
    };
    Ok((Buffer::from_f64_slice(&acc, input.dtype()), out_shape))
}

fn matmul_typed<T: WithDType>(
    a: &[T],
    lhs_layout: &Layout,
    b: &[T],
    rhs_layout: &Layout,
    m: usize,
    k: usize,
    n: usize,
) -> Vec<T> {
    // Gather both operands contiguously first so the inner loop indexes
    // flat slices regardless of the input layouts.
    if m == 0 || n == 0 {
        return vec![];
    }
    let av: Vec<f64> = lhs_layout.strided_indices().map(|i| a[i].to_f64()).collect();
    let bv: Vec<f64> = rhs_layout.strided_indices().map(|i| b[i].to_f64()).collect();
    let mut out = vec![T::zero(); m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut acc = 0.0f64;
            for p in 0..k {
                acc += av[i * k + p] * bv[p * n + j];
            }
            *cell = T::from_f64(acc);
        }
    });
    out
}

/// 2-D matrix multiply: [m, k] @ [k, n] → [m, n]. Rank and inner-dim
/// validation happens in the Array layer.
pub fn matmul(
    lhs: &Buffer,
    lhs_layout: &Layout,
    rhs: &Buffer,
    rhs_layout: &Layout,
    m: usize,
    k: usize,
    n: usize,
) -> Result<Buffer> {
    let out = match (lhs, rhs) {
        (Buffer::F32(a), Buffer::F32(b)) => {
            Buffer::F32(matmul_typed(a, lhs_layout, b, rhs_layout, m, k, n))
        }
        (Buffer::F64(a), Buffer::F64(b)) => {
            Buffer::F64(matmul_typed(a, lhs_layout, b, rhs_layout, m, k, n))
        }
        (Buffer::I32(a), Buffer::I32(b)) => {
            Buffer::I32(matmul_typed(a, lhs_layout, b, rhs_layout, m, k, n))
        }
        (Buffer::I64(a), Buffer::I64(b)) => {
            Buffer::I64(matmul_typed(a, lhs_layout, b, rhs_layout, m, k, n))
        }
        _ => {
            return Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            })
        }
    };
    Ok(out)
}

/// Gather a layout's elements into a fresh contiguous buffer.
pub fn contiguous(input: &Buffer, layout: &Layout) -> Buffer {
    fn gather<T: WithDType>(v: &[T], layout: &Layout) -> Vec<T> {
        layout.strided_indices().map(|i| v[i]).collect()
    }
    match input {
        Buffer::F32(v) => Buffer::F32(gather(v, layout)),
        Buffer::F64(v) => Buffer::F64(gather(v, layout)),
        Buffer::I32(v) => Buffer::I32(gather(v, layout)),
        Buffer::I64(v) => Buffer::I64(gather(v, layout)),
        Buffer::Bool(v) => Buffer::Bool(gather(v, layout)),
    }
}

/// Convert a layout's elements to `dtype` in a fresh contiguous buffer.
pub fn cast(input: &Buffer, layout: &Layout, dtype: DType) -> Buffer {
    let data: Vec<f64> = layout
        .strided_indices()
        .map(|i| input.get_f64(i))
        .collect();
    Buffer::from_f64_slice(&data, dtype)
}

/// Copy a layout's elements to host f64 values.
pub fn to_f64_vec(input: &Buffer, layout: &Layout) -> Vec<f64> {
    layout
        .strided_indices()
        .map(|i| input.get_f64(i))
        .collect()
}
