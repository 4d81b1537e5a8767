use std::collections::{HashMap, HashSet};

use crate::array::Array;
use crate::bail;
use crate::error::{Error, Result};
use crate::kernel::{BinaryOp, ReduceOp, UnaryOp};
use crate::op::{ArrayId, Index, Op};
use crate::shape::Shape;

// Backprop — reverse-mode gradient accumulation over the trace graph
//
// `backward(root)` walks the graph recorded in the arrays' ops:
//   1. DFS post-order topological sort from the scalar root.
//   2. Seed the root's cotangent with 1.
//   3. Walk the sort in reverse, applying each op's chain rule and
//      summing cotangents into the op's inputs.
//
// A value used twice receives the sum of both cotangents. Every rule is
// written in terms of recorded Array ops, so the produced gradients carry
// their own trace and can be differentiated again.

/// Accumulated cotangents, keyed by array id.
#[derive(Debug)]
pub struct GradStore(HashMap<ArrayId, Array>);

impl GradStore {
    fn new() -> Self {
        GradStore(HashMap::new())
    }

    /// The accumulated gradient for an array, if any flowed to it.
    pub fn get(&self, id: ArrayId) -> Option<&Array> {
        self.0.get(&id)
    }

    /// Take the gradient for an array out of the store.
    pub fn remove(&mut self, id: ArrayId) -> Option<Array> {
        self.0.remove(&id)
    }

    /// Add `grad` into the slot for `arr` (sum on fan-out).
    fn accumulate(&mut self, arr: &Array, grad: Array) -> Result<()> {
        let grad = match self.0.remove(&arr.id()) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.0.insert(arr.id(), grad);
        Ok(())
    }
}

fn topo_sort(root: &Array) -> Vec<Array> {
    fn walk(node: &Array, seen: &mut HashSet<ArrayId>, out: &mut Vec<Array>) {
        if !seen.insert(node.id()) {
            return;
        }
        for input in node.op().inputs() {
            walk(input, seen, out);
        }
        out.push(node.clone());
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk(root, &mut seen, &mut out);
    out
}

/// Sum a cotangent of the broadcast output shape back down to an input
/// shape: broadcast dimensions are summed out, then size-1 dims restored.
fn reduce_grad_to(grad: &Array, shape: &Shape) -> Result<Array> {
    if grad.shape() == shape {
        return Ok(grad.clone());
    }
    let extra = grad.rank() - shape.rank();
    let mut dims: Vec<usize> = (0..extra).collect();
    for (i, (&g, &s)) in grad.dims()[extra..].iter().zip(shape.dims()).enumerate() {
        if s == 1 && g != 1 {
            dims.push(extra + i);
        }
    }
    if dims.is_empty() {
        return grad.reshape(shape.clone());
    }
    grad.sum(&dims, false)?.reshape(shape.clone())
}

/// Expand a reduction output (or its cotangent) back to the reduced
/// input's shape: restore reduced dims as size 1, then broadcast.
fn expand_reduced(value: &Array, input: &Array, dims: &[usize], keep_dim: bool) -> Result<Array> {
    let rank = input.rank();
    let all: Vec<usize> = (0..rank).collect();
    let dims: &[usize] = if dims.is_empty() { &all } else { dims };
    let value = if keep_dim {
        value.clone()
    } else {
        let kept: Vec<usize> = input
            .dims()
            .iter()
            .enumerate()
            .map(|(d, &s)| if dims.contains(&d) { 1 } else { s })
            .collect();
        value.reshape(kept)?
    };
    value.broadcast_to(input.shape().clone())
}

/// Extract the region a functional update addressed out of a cotangent.
fn gather_region(grad: &Array, index: &Index) -> Result<Array> {
    match index {
        Index::At(coords) => {
            let mut g = grad.clone();
            for (dim, &c) in coords.iter().enumerate() {
                // Earlier narrows keep the rank, so dim indices stay valid.
                g = g.narrow(dim, c, 1)?;
            }
            g.reshape(Shape::scalar())
        }
        Index::Slice { dim, start, len } => grad.narrow(*dim, *start, *len),
    }
}

/// Reverse-mode accumulation from a scalar float root. Returns the
/// cotangent store; look gradients up by the input arrays' ids.
pub fn backward(root: &Array) -> Result<GradStore> {
    if root.rank() != 0 {
        return Err(Error::NotAScalar {
            shape: root.shape().clone(),
        });
    }
    if !root.dtype().is_float() {
        bail!("gradients require a float output, got {}", root.dtype());
    }

    let sorted = topo_sort(root);
    let mut grads = GradStore::new();
    grads.0.insert(root.id(), root.ones_like());

    for node in sorted.iter().rev() {
        let grad = match grads.get(node.id()) {
            Some(g) => g.clone(),
            None => continue,
        };
        match node.op() {
            Op::None => {}
            Op::Binary(op, lhs, rhs) => {
                let (dl, dr) = match op {
                    BinaryOp::Add => (grad.clone(), grad.clone()),
                    BinaryOp::Sub => (grad.clone(), grad.neg()?),
                    BinaryOp::Mul => (grad.mul(rhs)?, grad.mul(lhs)?),
                    BinaryOp::Div => {
                        let dl = grad.div(rhs)?;
                        let dr = grad.mul(lhs)?.div(&rhs.mul(rhs)?)?.neg()?;
                        (dl, dr)
                    }
                };
                grads.accumulate(lhs, reduce_grad_to(&dl, lhs.shape())?)?;
                grads.accumulate(rhs, reduce_grad_to(&dr, rhs.shape())?)?;
            }
            Op::Unary(op, x) => {
                let dx = match op {
                    UnaryOp::Neg => grad.neg()?,
                    // d|x| = sign(x); x == 0 gets +1.
                    UnaryOp::Abs => {
                        let sign = x.ge(&x.zeros_like())?.cast(x.dtype())?.affine(2.0, -1.0)?;
                        grad.mul(&sign)?
                    }
                    UnaryOp::Exp => grad.mul(node)?,
                    UnaryOp::Log => grad.div(x)?,
                    UnaryOp::Sqrt => grad.div(&node.affine(2.0, 0.0)?)?,
                    UnaryOp::Square => grad.mul(&x.affine(2.0, 0.0)?)?,
                    UnaryOp::Sin => grad.mul(&x.cos()?)?,
                    UnaryOp::Cos => grad.mul(&x.sin()?.neg()?)?,
                    UnaryOp::Tanh => grad.mul(&node.square()?.affine(-1.0, 1.0)?)?,
                };
                grads.accumulate(x, dx)?;
            }
            Op::Powf(x, e) => {
                let dx = grad.mul(&x.powf(e - 1.0)?.affine(*e, 0.0)?)?;
                grads.accumulate(x, dx)?;
            }
            Op::Affine(x, mul, _) => {
                grads.accumulate(x, grad.affine(*mul, 0.0)?)?;
            }
            Op::Reduce(op, x, dims, keep_dim) => match op {
                ReduceOp::Sum => {
                    grads.accumulate(x, expand_reduced(&grad, x, dims, *keep_dim)?)?;
                }
                ReduceOp::Mean => {
                    let count = (x.elem_count() / node.elem_count()) as f64;
                    let dx = expand_reduced(&grad, x, dims, *keep_dim)?.affine(1.0 / count, 0.0)?;
                    grads.accumulate(x, dx)?;
                }
                // Gradient flows to every element equal to the extremum;
                // ties each receive the full cotangent.
                ReduceOp::Max | ReduceOp::Min => {
                    let peak = expand_reduced(node, x, dims, *keep_dim)?;
                    let mask = x.eq(&peak)?.cast(x.dtype())?;
                    let dx = mask.mul(&expand_reduced(&grad, x, dims, *keep_dim)?)?;
                    grads.accumulate(x, dx)?;
                }
            },
            Op::Matmul(lhs, rhs) => {
                grads.accumulate(lhs, grad.matmul(&rhs.t()?)?)?;
                grads.accumulate(rhs, lhs.t()?.matmul(&grad)?)?;
            }
            Op::Reshape(x) => {
                grads.accumulate(x, grad.reshape(x.shape().clone())?)?;
            }
            Op::Transpose(x, dim0, dim1) => {
                grads.accumulate(x, grad.transpose(*dim0, *dim1)?)?;
            }
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let index = Index::Slice {
                    dim: *dim,
                    start: *start,
                    len: *len,
                };
                let dx = input.zeros_like().update(&index, &grad)?;
                grads.accumulate(input, dx)?;
            }
            Op::Broadcast(x) => {
                grads.accumulate(x, reduce_grad_to(&grad, x.shape())?)?;
            }
            Op::Stack(inputs, axis) => {
                for (i, input) in inputs.iter().enumerate() {
                    let slice = grad.narrow(*axis, i, 1)?.reshape(input.shape().clone())?;
                    grads.accumulate(input, slice)?;
                }
            }
            Op::Update {
                input,
                values,
                index,
            } => {
                // The written region's cotangent belongs to `values`; the
                // rest flows to `input` with the region zeroed out.
                grads.accumulate(values, gather_region(&grad, index)?)?;
                let dx = grad.update(index, &values.zeros_like())?;
                grads.accumulate(input, dx)?;
            }
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => {
                let zero = grad.zeros_like();
                let dt = mask.where_cond(&grad, &zero)?;
                let df = mask.where_cond(&zero, &grad)?;
                grads.accumulate(on_true, reduce_grad_to(&dt, on_true.shape())?)?;
                grads.accumulate(on_false, reduce_grad_to(&df, on_false.shape())?)?;
            }
            Op::Cast(x) => {
                if x.dtype().is_float() {
                    grads.accumulate(x, grad.cast(x.dtype())?)?;
                }
            }
            // Comparisons are piecewise constant; nothing flows back.
            Op::Cmp(_, _, _) => {}
            Op::Transfer(x) => {
                let dx = if x.device() == node.device() {
                    grad.clone()
                } else {
                    grad.place(x.device())?
                };
                grads.accumulate(x, dx)?;
            }
        }
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn scalar(v: f64) -> Array {
        Array::full((), v, DType::F64)
    }

    #[test]
    fn test_square_gradient() {
        // d/dx x^2 at 3 is 6.
        let x = scalar(3.0);
        let y = x.square().unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(grads.get(x.id()).unwrap().to_scalar().unwrap(), 6.0);
    }

    #[test]
    fn test_two_variable_polynomial() {
        // h(x, y) = x^2 + 3xy + y^2 at (2, 1): dh/dx = 7, dh/dy = 8.
        let x = scalar(2.0);
        let y = scalar(1.0);
        let xy = x.mul(&y).unwrap().affine(3.0, 0.0).unwrap();
        let h = x
            .square()
            .unwrap()
            .add(&xy)
            .unwrap()
            .add(&y.square().unwrap())
            .unwrap();
        let grads = backward(&h).unwrap();
        assert_eq!(grads.get(x.id()).unwrap().to_scalar().unwrap(), 7.0);
        assert_eq!(grads.get(y.id()).unwrap().to_scalar().unwrap(), 8.0);
    }

    #[test]
    fn test_fan_out_sums() {
        // y = x * x written with two uses of x: dy/dx = 2x.
        let x = scalar(4.0);
        let y = x.mul(&x).unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(grads.get(x.id()).unwrap().to_scalar().unwrap(), 8.0);
    }

    #[test]
    fn test_broadcast_gradient_reduces() {
        // sum((a [2,3]) + (b [3])): db sums over the broadcast dim.
        let a = Array::ones((2, 3), DType::F64);
        let b = Array::ones(3, DType::F64);
        let y = a.add(&b).unwrap().sum_all().unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(grads.get(b.id()).unwrap().to_f64_vec().unwrap(), vec![2.0; 3]);
        assert_eq!(grads.get(a.id()).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_matmul_gradient() {
        let a = Array::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64).unwrap();
        let b = Array::eye(2, DType::F64);
        let y = a.matmul(&b).unwrap().sum_all().unwrap();
        let grads = backward(&y).unwrap();
        // d(sum(A @ I))/dA = ones @ I^T = ones.
        assert_eq!(grads.get(a.id()).unwrap().to_f64_vec().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_update_gradient_splits() {
        // y = sum(update(x, [1], v)): x's grad is 1 everywhere except the
        // overwritten slot, v's grad is 1.
        let x = Array::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64).unwrap();
        let v = scalar(9.0);
        let y = x
            .update(&Index::At(vec![1]), &v)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(
            grads.get(x.id()).unwrap().to_f64_vec().unwrap(),
            vec![1.0, 0.0, 1.0]
        );
        assert_eq!(grads.get(v.id()).unwrap().to_scalar().unwrap(), 1.0);
    }

    #[test]
    fn test_max_gradient_to_extrema() {
        let x = Array::from_f64_slice(&[1.0, 5.0, 5.0, 2.0], 4, DType::F64).unwrap();
        let y = x.max(&[], false).unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(
            grads.get(x.id()).unwrap().to_f64_vec().unwrap(),
            vec![0.0, 1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_non_scalar_root_rejected() {
        let x = Array::ones(3, DType::F64);
        assert!(matches!(
            backward(&x).unwrap_err(),
            Error::NotAScalar { .. }
        ));
    }

    #[test]
    fn test_mean_gradient() {
        let x = Array::ones(4, DType::F64);
        let y = x.mean_all().unwrap();
        let grads = backward(&y).unwrap();
        assert_eq!(grads.get(x.id()).unwrap().to_f64_vec().unwrap(), vec![0.25; 4]);
    }
}
