use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape of an array
//
//   Scalar: Shape([])        — 0 dimensions, 1 element
//   Vector: Shape([5])       — 1 dimension, 5 elements
//   Matrix: Shape([2, 3])    — 2 dimensions, 6 elements
//
// The shape determines the element count (product of dims), the default
// row-major strides, and whether two arrays are broadcast-compatible.

/// N-dimensional shape of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape (rank 0).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, ...).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element; any zero-size dimension makes
    /// the array empty.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major (C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4] the strides are [12, 4, 1]: the last dimension
    /// is contiguous, each earlier dimension jumps by the product of the
    /// dimensions after it.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// Rules (NumPy-style):
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. A pair of dimensions is compatible if equal or one of them is 1.
    ///   3. The shorter shape is left-padded with size-1 dimensions.
    ///   4. Each output dimension is the max of the compared pair.
    ///
    /// Examples:
    ///   [2, 3] and [3]      → [2, 3]
    ///   [2, 1] and [1, 3]   → [2, 3]
    ///   [2, 3] and [4]      → BroadcastError (3 vs 4, neither is 1)
    pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            // Index from the right; missing leading dims count as 1.
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::BroadcastError {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                    dim: i,
                    lhs_size: ld,
                    rhs_size: rd,
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Whether this shape can be broadcast to `target` without copying.
    pub fn broadcastable_to(&self, target: &Shape) -> bool {
        if self.rank() > target.rank() {
            return false;
        }
        let offset = target.rank() - self.rank();
        self.dims()
            .iter()
            .zip(target.dims()[offset..].iter())
            .all(|(&s, &t)| s == t || s == 1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations:
// Shape::from((2, 3)) instead of Shape::new(vec![2, 3]).

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_zero_size_dimension() {
        let s = Shape::from((0, 2));
        assert_eq!(s.elem_count(), 0);
        assert_eq!(Shape::from(0).elem_count(), 0);
    }

    #[test]
    fn test_matrix_shape() {
        let s = Shape::from((2, 3));
        assert_eq!(s.rank(), 2);
        assert_eq!(s.elem_count(), 6);
        assert_eq!(s.stride_contiguous(), vec![3, 1]);
    }

    #[test]
    fn test_broadcast_trailing() {
        let out = Shape::broadcast(&Shape::from((2, 3)), &Shape::from(3)).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }

    #[test]
    fn test_broadcast_ones() {
        let out = Shape::broadcast(&Shape::from((2, 1)), &Shape::from((1, 3))).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }

    #[test]
    fn test_broadcast_incompatible() {
        let err = Shape::broadcast(&Shape::from((2, 3)), &Shape::from(4)).unwrap_err();
        match err {
            Error::BroadcastError {
                lhs_size, rhs_size, ..
            } => {
                assert_eq!((lhs_size, rhs_size), (3, 4));
            }
            other => panic!("expected BroadcastError, got {other:?}"),
        }
    }

    #[test]
    fn test_broadcastable_to() {
        assert!(Shape::from(3).broadcastable_to(&Shape::from((2, 3))));
        assert!(Shape::from((1, 3)).broadcastable_to(&Shape::from((5, 3))));
        assert!(!Shape::from(4).broadcastable_to(&Shape::from((2, 3))));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
