use std::sync::Arc;

use rand::Rng;
use rand_distr::Distribution;

use crate::bail;
use crate::device::{self, Device};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::{self, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::layout::Layout;
use crate::op::{ArrayId, Index, Op};
use crate::shape::Shape;
use crate::storage::{Buffer, Storage};

// Array — the immutable n-dimensional value
//
// An Array is a cheap-to-clone handle (Arc) to:
//   - storage: the element buffer, possibly still in flight from a
//     device transfer,
//   - layout: how the logical shape maps onto that buffer,
//   - op: the operation that produced it, which links arrays into the
//     trace graph backprop and the JIT walk over.
//
// Arrays are never mutated. `update` and every other operation return a
// new Array; views (transpose, narrow, broadcast_to) share the buffer
// through a rewritten layout.
//
// A *traced* array is a placeholder (or derives from one): its buffer
// holds zeros only so shapes and dtypes flow through the eager kernels,
// and any attempt to read its concrete value fails with
// UnsupportedTraceControlFlow.

/// Immutable n-dimensional array handle. Cloning only bumps a refcount.
#[derive(Clone)]
pub struct Array(Arc<Inner>);

struct Inner {
    id: ArrayId,
    storage: Storage,
    layout: Layout,
    dtype: DType,
    device: Device,
    op: Op,
    trace: Trace,
}

/// Trace provenance: whether the array derives from a placeholder, and
/// which argument position that placeholder stood for (when known).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Trace {
    active: bool,
    arg: Option<usize>,
}

impl Trace {
    const NONE: Trace = Trace {
        active: false,
        arg: None,
    };

    fn placeholder(arg: Option<usize>) -> Trace {
        Trace { active: true, arg }
    }

    /// Combine provenance from two operands; the first known argument
    /// position wins.
    fn join(self, other: Trace) -> Trace {
        Trace {
            active: self.active || other.active,
            arg: self.arg.or(other.arg),
        }
    }
}

impl Array {
    // Construction

    fn from_buffer(buffer: Buffer, shape: Shape, device: Device, op: Op, trace: Trace) -> Array {
        let dtype = buffer.dtype();
        Array(Arc::new(Inner {
            id: ArrayId::fresh(),
            storage: Storage::ready(buffer),
            layout: Layout::contiguous(shape),
            dtype,
            device,
            op,
            trace,
        }))
    }

    /// A view sharing this array's storage under a different layout.
    fn view(&self, layout: Layout, op: Op) -> Array {
        Array(Arc::new(Inner {
            id: ArrayId::fresh(),
            storage: self.0.storage.clone(),
            layout,
            dtype: self.0.dtype,
            device: self.0.device,
            op,
            trace: self.0.trace,
        }))
    }

    /// Array of zeros.
    pub fn zeros<S: Into<Shape>>(shape: S, dtype: DType) -> Array {
        let shape = shape.into();
        Self::from_buffer(
            Buffer::zeros(&shape, dtype),
            shape,
            Device::CPU,
            Op::None,
            Trace::NONE,
        )
    }

    /// Array of ones.
    pub fn ones<S: Into<Shape>>(shape: S, dtype: DType) -> Array {
        let shape = shape.into();
        Self::from_buffer(
            Buffer::ones(&shape, dtype),
            shape,
            Device::CPU,
            Op::None,
            Trace::NONE,
        )
    }

    /// Array filled with a single value.
    pub fn full<S: Into<Shape>>(shape: S, val: f64, dtype: DType) -> Array {
        let shape = shape.into();
        Self::from_buffer(
            Buffer::full(&shape, val, dtype),
            shape,
            Device::CPU,
            Op::None,
            Trace::NONE,
        )
    }

    /// n x n identity matrix.
    pub fn eye(n: usize, dtype: DType) -> Array {
        let mut data = vec![0.0f64; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_buffer(
            Buffer::from_f64_slice(&data, dtype),
            Shape::from((n, n)),
            Device::CPU,
            Op::None,
            Trace::NONE,
        )
    }

    /// Array from host values; the slice length must match the shape.
    pub fn from_f64_slice<S: Into<Shape>>(data: &[f64], shape: S, dtype: DType) -> Result<Array> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_buffer(
            Buffer::from_f64_slice(data, dtype),
            shape,
            Device::CPU,
            Op::None,
            Trace::NONE,
        ))
    }

    /// 2-D array from one level of nesting: equal-length rows. Deeper
    /// shapes go through `from_f64_slice` with an explicit shape.
    pub fn from_nested(rows: &[Vec<f64>], dtype: DType) -> Result<Array> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                bail!(
                    "rows must have equal length: expected {}, got {}",
                    cols,
                    row.len()
                );
            }
            data.extend_from_slice(row);
        }
        Self::from_f64_slice(&data, Shape::from((rows.len(), cols)), dtype)
    }

    /// `steps` evenly spaced values from `start` to `end` inclusive.
    pub fn linspace(start: f64, end: f64, steps: usize, dtype: DType) -> Result<Array> {
        if steps == 0 {
            bail!("linspace requires at least one step");
        }
        let data: Vec<f64> = if steps == 1 {
            vec![start]
        } else {
            let delta = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + delta * i as f64).collect()
        };
        Self::from_f64_slice(&data, Shape::from(steps), dtype)
    }

    /// Uniform [0, 1) samples from the thread-local generator.
    /// For reproducible sampling use the keyed sampler in the facade.
    pub fn rand<S: Into<Shape>>(shape: S, dtype: DType) -> Result<Array> {
        let shape = shape.into();
        if !dtype.is_float() {
            bail!("rand requires a float dtype, got {dtype}");
        }
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Self::from_f64_slice(&data, shape, dtype)
    }

    /// Standard normal samples from the thread-local generator.
    pub fn randn<S: Into<Shape>>(shape: S, dtype: DType) -> Result<Array> {
        let shape = shape.into();
        if !dtype.is_float() {
            bail!("randn requires a float dtype, got {dtype}");
        }
        let normal = rand_distr::Normal::new(0.0, 1.0).map_err(|e| Error::msg(e.to_string()))?;
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| normal.sample(&mut rng))
            .collect();
        Self::from_f64_slice(&data, shape, dtype)
    }

    /// Traced placeholder: carries shape and dtype only. Its zero-filled
    /// buffer lets the eager kernels run during an abstract trace, but
    /// host reads of the value fail.
    pub fn placeholder<S: Into<Shape>>(shape: S, dtype: DType) -> Array {
        Self::placeholder_inner(shape.into(), dtype, None)
    }

    /// Placeholder standing for the argument at `index`; trace failure
    /// messages name the position.
    pub fn placeholder_for_arg<S: Into<Shape>>(shape: S, dtype: DType, index: usize) -> Array {
        Self::placeholder_inner(shape.into(), dtype, Some(index))
    }

    fn placeholder_inner(shape: Shape, dtype: DType, arg: Option<usize>) -> Array {
        Self::from_buffer(
            Buffer::zeros(&shape, dtype),
            shape,
            Device::CPU,
            Op::None,
            Trace::placeholder(arg),
        )
    }

    // Accessors

    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    pub fn shape(&self) -> &Shape {
        self.0.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.0.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.0.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.0.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn device(&self) -> Device {
        self.0.device
    }

    pub fn op(&self) -> &Op {
        &self.0.op
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.0.layout
    }

    /// Whether this array derives from a traced placeholder.
    pub fn is_traced(&self) -> bool {
        self.0.trace.active
    }

    /// Whether the buffer has materialized (false while a transfer is in
    /// flight).
    pub fn is_ready(&self) -> bool {
        self.0.storage.is_ready()
    }

    /// Block until any pending transfer has materialized this array.
    pub fn sync(&self) -> &Self {
        self.0.storage.wait_with(|_| ());
        self
    }

    fn with_buffer<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        self.0.storage.wait_with(f)
    }

    fn buffer_clone(&self) -> Buffer {
        self.0.storage.wait_clone()
    }

    fn guard_traced(&self, what: &str) -> Result<()> {
        if self.0.trace.active {
            let origin = match self.0.trace.arg {
                Some(i) => format!(" derived from argument {i}"),
                None => String::new(),
            };
            return Err(Error::UnsupportedTraceControlFlow {
                context: format!(
                    "{what} on a traced array{origin} (produced by `{}`): its concrete \
                     value does not exist at trace time",
                    self.0.op.name()
                ),
            });
        }
        Ok(())
    }

    fn check_same_device(&self, rhs: &Array) -> Result<()> {
        if self.0.device != rhs.0.device {
            return Err(Error::DeviceMismatch {
                lhs: self.0.device.to_string(),
                rhs: rhs.0.device.to_string(),
            });
        }
        Ok(())
    }

    fn check_same_dtype(&self, rhs: &Array) -> Result<()> {
        if self.0.dtype != rhs.0.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.0.dtype,
                got: rhs.0.dtype,
            });
        }
        Ok(())
    }

    /// All-zeros array with this array's shape, dtype and device tag.
    pub fn zeros_like(&self) -> Array {
        Self::from_buffer(
            Buffer::zeros(self.shape(), self.0.dtype),
            self.shape().clone(),
            self.0.device,
            Op::None,
            Trace::NONE,
        )
    }

    /// All-ones array with this array's shape, dtype and device tag.
    pub fn ones_like(&self) -> Array {
        Self::from_buffer(
            Buffer::ones(self.shape(), self.0.dtype),
            self.shape().clone(),
            self.0.device,
            Op::None,
            Trace::NONE,
        )
    }

    // Elementwise arithmetic

    fn binary_impl(&self, rhs: &Array, op: BinaryOp) -> Result<Array> {
        self.check_same_dtype(rhs)?;
        self.check_same_device(rhs)?;
        if !self.0.dtype.is_numeric() {
            bail!("arithmetic on {} arrays is not supported", self.0.dtype);
        }
        let out_shape = Shape::broadcast(self.shape(), rhs.shape())?;
        let lhs_layout = self.layout().broadcast_to(&out_shape)?;
        let rhs_layout = rhs.layout().broadcast_to(&out_shape)?;
        // Buffers are cloned out rather than read under nested locks so
        // that x op x (shared storage) cannot deadlock.
        let lb = self.buffer_clone();
        let rb = rhs.buffer_clone();
        let buf = kernel::binary(op, &lb, &lhs_layout, &rb, &rhs_layout)?;
        Ok(Self::from_buffer(
            buf,
            out_shape,
            self.0.device,
            Op::Binary(op, self.clone(), rhs.clone()),
            self.0.trace.join(rhs.0.trace),
        ))
    }

    pub fn add(&self, rhs: &Array) -> Result<Array> {
        self.binary_impl(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Array) -> Result<Array> {
        self.binary_impl(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Array) -> Result<Array> {
        self.binary_impl(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Array) -> Result<Array> {
        self.binary_impl(rhs, BinaryOp::Div)
    }

    // Unary math

    fn unary_impl(&self, op: UnaryOp) -> Result<Array> {
        let buf = self.with_buffer(|b| kernel::unary(op, b, self.layout()))?;
        Ok(Self::from_buffer(
            buf,
            self.shape().clone(),
            self.0.device,
            Op::Unary(op, self.clone()),
            self.0.trace,
        ))
    }

    pub fn neg(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Square)
    }

    pub fn sin(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Cos)
    }

    pub fn tanh(&self) -> Result<Array> {
        self.unary_impl(UnaryOp::Tanh)
    }

    /// Elementwise power with a host-constant exponent.
    pub fn powf(&self, exponent: f64) -> Result<Array> {
        let buf = self.with_buffer(|b| kernel::powf(b, self.layout(), exponent))?;
        Ok(Self::from_buffer(
            buf,
            self.shape().clone(),
            self.0.device,
            Op::Powf(self.clone(), exponent),
            self.0.trace,
        ))
    }

    /// Elementwise x * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Array> {
        let buf = self.with_buffer(|b| kernel::affine(b, self.layout(), mul, add))?;
        Ok(Self::from_buffer(
            buf,
            self.shape().clone(),
            self.0.device,
            Op::Affine(self.clone(), mul, add),
            self.0.trace,
        ))
    }

    // Reductions

    fn reduce_impl(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Array> {
        let (buf, out_shape) =
            self.with_buffer(|b| kernel::reduce(op, b, self.layout(), dims, keep_dim))?;
        Ok(Self::from_buffer(
            buf,
            out_shape,
            self.0.device,
            Op::Reduce(op, self.clone(), dims.to_vec(), keep_dim),
            self.0.trace,
        ))
    }

    /// Sum over `dims`; empty `dims` sums everything.
    pub fn sum(&self, dims: &[usize], keep_dim: bool) -> Result<Array> {
        self.reduce_impl(ReduceOp::Sum, dims, keep_dim)
    }

    pub fn mean(&self, dims: &[usize], keep_dim: bool) -> Result<Array> {
        self.reduce_impl(ReduceOp::Mean, dims, keep_dim)
    }

    pub fn max(&self, dims: &[usize], keep_dim: bool) -> Result<Array> {
        self.reduce_impl(ReduceOp::Max, dims, keep_dim)
    }

    pub fn min(&self, dims: &[usize], keep_dim: bool) -> Result<Array> {
        self.reduce_impl(ReduceOp::Min, dims, keep_dim)
    }

    /// Sum of every element, as a scalar array.
    pub fn sum_all(&self) -> Result<Array> {
        self.sum(&[], false)
    }

    /// Mean of every element, as a scalar array.
    pub fn mean_all(&self) -> Result<Array> {
        self.mean(&[], false)
    }

    // Matmul

    /// 2-D matrix multiply: [m, k] @ [k, n] → [m, n].
    pub fn matmul(&self, rhs: &Array) -> Result<Array> {
        self.check_same_dtype(rhs)?;
        self.check_same_device(rhs)?;
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        if rhs.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rhs.rank(),
            });
        }
        let (m, k1) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let lb = self.buffer_clone();
        let rb = rhs.buffer_clone();
        let buf = kernel::matmul(&lb, self.layout(), &rb, rhs.layout(), m, k1, n)?;
        Ok(Self::from_buffer(
            buf,
            Shape::from((m, n)),
            self.0.device,
            Op::Matmul(self.clone(), rhs.clone()),
            self.0.trace.join(rhs.0.trace),
        ))
    }

    // Shape manipulation

    /// Same elements under a new shape; element counts must match.
    pub fn reshape<S: Into<Shape>>(&self, shape: S) -> Result<Array> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        let buf = self.with_buffer(|b| kernel::contiguous(b, self.layout()));
        Ok(Self::from_buffer(
            buf,
            shape,
            self.0.device,
            Op::Reshape(self.clone()),
            self.0.trace,
        ))
    }

    /// Collapse to one dimension.
    pub fn flatten(&self) -> Result<Array> {
        self.reshape(self.elem_count())
    }

    /// Swap two dimensions. A view, no data movement.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Array> {
        let layout = self.layout().transpose(dim0, dim1)?;
        Ok(self.view(layout, Op::Transpose(self.clone(), dim0, dim1)))
    }

    /// Swap the last two dimensions (matrix transpose).
    pub fn t(&self) -> Result<Array> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.transpose(rank - 2, rank - 1)
    }

    /// Slice along one dimension. A view, no data movement.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Array> {
        let layout = self.layout().narrow(dim, start, len)?;
        Ok(self.view(
            layout,
            Op::Narrow {
                input: self.clone(),
                dim,
                start,
                len,
            },
        ))
    }

    /// Broadcast to a larger shape. A stride-0 view, no data movement.
    pub fn broadcast_to<S: Into<Shape>>(&self, shape: S) -> Result<Array> {
        let shape = shape.into();
        let layout = self.layout().broadcast_to(&shape)?;
        Ok(self.view(layout, Op::Broadcast(self.clone())))
    }

    /// Stack same-shape arrays along a new axis.
    pub fn stack(arrays: &[Array], axis: usize) -> Result<Array> {
        let first = match arrays.first() {
            Some(a) => a,
            None => bail!("stack requires at least one array"),
        };
        if axis > first.rank() {
            return Err(Error::DimOutOfRange {
                dim: axis,
                rank: first.rank() + 1,
            });
        }
        for a in arrays.iter().skip(1) {
            first.check_same_dtype(a)?;
            first.check_same_device(a)?;
            if a.shape() != first.shape() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: a.shape().clone(),
                });
            }
        }
        let mut out_dims = first.dims().to_vec();
        out_dims.insert(axis, arrays.len());
        let out_shape = Shape::new(out_dims);

        // Per input: `outer` blocks of `inner` contiguous elements, with
        // the new axis interleaving the blocks across inputs.
        let outer: usize = first.dims()[..axis].iter().product();
        let inner: usize = first.dims()[axis..].iter().product();
        let gathered: Vec<Vec<f64>> = arrays
            .iter()
            .map(|a| a.with_buffer(|b| kernel::to_f64_vec(b, a.layout())))
            .collect();
        let mut data = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for g in &gathered {
                data.extend_from_slice(&g[o * inner..(o + 1) * inner]);
            }
        }
        Ok(Self::from_buffer(
            Buffer::from_f64_slice(&data, first.0.dtype),
            out_shape,
            first.0.device,
            Op::Stack(arrays.to_vec(), axis),
            arrays
                .iter()
                .fold(Trace::NONE, |acc, a| acc.join(a.0.trace)),
        ))
    }

    // Comparisons and selection

    fn cmp_impl(&self, rhs: &Array, op: CmpOp) -> Result<Array> {
        self.check_same_dtype(rhs)?;
        self.check_same_device(rhs)?;
        let out_shape = Shape::broadcast(self.shape(), rhs.shape())?;
        let lhs_layout = self.layout().broadcast_to(&out_shape)?;
        let rhs_layout = rhs.layout().broadcast_to(&out_shape)?;
        let lb = self.buffer_clone();
        let rb = rhs.buffer_clone();
        let buf = kernel::cmp(op, &lb, &lhs_layout, &rb, &rhs_layout)?;
        Ok(Self::from_buffer(
            buf,
            out_shape,
            self.0.device,
            Op::Cmp(op, self.clone(), rhs.clone()),
            self.0.trace.join(rhs.0.trace),
        ))
    }

    pub fn eq(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Eq)
    }

    pub fn ne(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Ne)
    }

    pub fn lt(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Lt)
    }

    pub fn le(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Le)
    }

    pub fn gt(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Gt)
    }

    pub fn ge(&self, rhs: &Array) -> Result<Array> {
        self.cmp_impl(rhs, CmpOp::Ge)
    }

    /// Select by mask: `self` chooses `on_true` where nonzero, else
    /// `on_false`. This is the data-dependent branch primitive; host
    /// `if` on an array value cannot be traced.
    pub fn where_cond(&self, on_true: &Array, on_false: &Array) -> Result<Array> {
        on_true.check_same_dtype(on_false)?;
        self.check_same_device(on_true)?;
        self.check_same_device(on_false)?;
        let shape = Shape::broadcast(self.shape(), on_true.shape())?;
        let shape = Shape::broadcast(&shape, on_false.shape())?;
        let mask_layout = self.layout().broadcast_to(&shape)?;
        let t_layout = on_true.layout().broadcast_to(&shape)?;
        let f_layout = on_false.layout().broadcast_to(&shape)?;
        let mb = self.buffer_clone();
        let tb = on_true.buffer_clone();
        let fb = on_false.buffer_clone();
        let buf = kernel::where_cond(&mb, &mask_layout, &tb, &t_layout, &fb, &f_layout)?;
        Ok(Self::from_buffer(
            buf,
            shape,
            self.0.device,
            Op::WhereCond {
                mask: self.clone(),
                on_true: on_true.clone(),
                on_false: on_false.clone(),
            },
            self.0.trace.join(on_true.0.trace).join(on_false.0.trace),
        ))
    }

    /// Convert elements to another dtype.
    pub fn cast(&self, dtype: DType) -> Result<Array> {
        let buf = self.with_buffer(|b| kernel::cast(b, self.layout(), dtype));
        Ok(Self::from_buffer(
            buf,
            self.shape().clone(),
            self.0.device,
            Op::Cast(self.clone()),
            self.0.trace,
        ))
    }

    // Functional update

    /// The contiguous layout of the region `index` addresses, plus the
    /// shape `values` must have.
    fn index_region(&self, index: &Index) -> Result<Layout> {
        let base = Layout::contiguous(self.shape().clone());
        match index {
            Index::At(coords) => {
                if coords.len() != self.rank() {
                    return Err(Error::RankMismatch {
                        expected: self.rank(),
                        got: coords.len(),
                    });
                }
                for (d, &c) in coords.iter().enumerate() {
                    let dim_size = self.dims()[d];
                    if c >= dim_size {
                        return Err(Error::NarrowOutOfBounds {
                            dim: d,
                            start: c,
                            len: 1,
                            dim_size,
                        });
                    }
                }
                Ok(Layout::new(Shape::scalar(), vec![], base.flat_index(coords)))
            }
            Index::Slice { dim, start, len } => base.narrow(*dim, *start, *len),
        }
    }

    /// A copy of this array with `values` written at `index`. The source
    /// is untouched; the result is a fresh array that differs only at
    /// the addressed region.
    pub fn update(&self, index: &Index, values: &Array) -> Result<Array> {
        self.check_same_dtype(values)?;
        self.check_same_device(values)?;
        let region = self.index_region(index)?;
        if values.shape() != region.shape() {
            return Err(Error::ShapeMismatch {
                expected: region.shape().clone(),
                got: values.shape().clone(),
            });
        }
        let mut data = self.with_buffer(|b| kernel::to_f64_vec(b, self.layout()));
        let vals = values.with_buffer(|b| kernel::to_f64_vec(b, values.layout()));
        for (pos, v) in region.strided_indices().zip(vals) {
            data[pos] = v;
        }
        Ok(Self::from_buffer(
            Buffer::from_f64_slice(&data, self.0.dtype),
            self.shape().clone(),
            self.0.device,
            Op::Update {
                input: self.clone(),
                values: values.clone(),
                index: index.clone(),
            },
            self.0.trace.join(values.0.trace),
        ))
    }

    // Device placement

    /// Place this array on a device. Returns immediately with a new
    /// array whose buffer materializes asynchronously; reads on it wait.
    pub fn place(&self, target: Device) -> Result<Array> {
        let registered = device::devices(target.kind)?;
        if !registered.contains(&target) {
            return Err(Error::DeviceUnavailable {
                kind: target.to_string(),
            });
        }
        let storage = Storage::pending();
        let src = self.0.storage.clone();
        let dst = storage.clone();
        std::thread::spawn(move || {
            // Models the transfer: wait for the source (it may itself be
            // in flight), then hand a copy to the new device.
            dst.fulfill(src.wait_clone());
        });
        Ok(Array(Arc::new(Inner {
            id: ArrayId::fresh(),
            storage,
            layout: self.0.layout.clone(),
            dtype: self.0.dtype,
            device: target,
            op: Op::Transfer(self.clone()),
            trace: self.0.trace,
        })))
    }

    // Host reads

    /// All elements as f64, in row-major logical order. Waits for any
    /// pending transfer; fails on traced arrays.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.guard_traced("reading the value")?;
        Ok(self.with_buffer(|b| kernel::to_f64_vec(b, self.layout())))
    }

    /// The value of a rank-0 array. Fails on traced arrays: branching on
    /// an array value cannot be recorded in a trace.
    pub fn to_scalar(&self) -> Result<f64> {
        self.guard_traced("reading the scalar value")?;
        if self.rank() != 0 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.with_buffer(|b| b.get_f64(self.layout().offset())))
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("id", &self.0.id)
            .field("shape", &self.shape().dims())
            .field("dtype", &self.0.dtype)
            .field("device", &self.0.device.to_string())
            .field("op", &self.0.op.name())
            .field("traced", &self.0.trace.active)
            .finish()
    }
}
