use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how an array's logical shape maps onto flat storage
//
// A Layout is shape + strides + offset. Decoupling the logical view from
// the buffer makes transpose, narrow, and broadcasting "free": they only
// rewrite the layout, never the data.
//
//   - Transpose swaps two strides.
//   - Narrow bumps the offset and shrinks one dimension.
//   - Broadcasting sets a stride to 0 so one element repeats.
//
// Kernels never index buffers directly; they walk `strided_indices()`,
// which yields the correct flat position for every logical element even
// when the layout is non-contiguous.

/// Maps an array's logical shape to positions in flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the buffer where this view's data starts.
    offset: usize,
}

impl Layout {
    /// Contiguous (row-major) layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this layout is row-major with no gaps and no offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions. No data movement.
    ///
    /// [2, 3, 4] transpose(0, 2) → shape [4, 3, 2], strides [1, 4, 12].
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Slice along a dimension. Same storage, adjusted shape and offset.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// View this layout broadcast to `target`. Size-1 dimensions and
    /// missing leading dimensions get stride 0 (the element repeats).
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        if !self.shape.broadcastable_to(target) {
            return Err(Error::BroadcastError {
                lhs: self.shape.clone(),
                rhs: target.clone(),
                dim: 0,
                lhs_size: self.elem_count(),
                rhs_size: target.elem_count(),
            });
        }
        let offset_dims = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for (i, (&sd, &st)) in self
            .shape
            .dims()
            .iter()
            .zip(self.strides.iter())
            .enumerate()
        {
            if sd == target.dims()[i + offset_dims] {
                strides[i + offset_dims] = st;
            }
            // sd == 1 with a larger target dim keeps stride 0.
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index for a multi-dimensional index:
    /// offset + sum(index[i] * stride[i]).
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over the flat storage index of every logical element,
    /// in row-major logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator yielding flat storage indices for each element of a Layout.
///
/// Contiguous layouts count 0, 1, 2, ...; transposed or broadcast layouts
/// jump through memory following the strides.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        let rank = layout.rank();
        StridedIter {
            current: vec![0; rank],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    /// Advance the multi-dimensional index by one, rightmost dim first.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        // [2,3] data 0..6 read as its transpose visits 0,3,1,4,2,5.
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let transposed = layout.transpose(0, 1).unwrap();
        assert_eq!(transposed.dims(), &[3, 2]);
        assert!(!transposed.is_contiguous());
        let indices: Vec<usize> = transposed.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrow() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let narrowed = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(narrowed.dims(), &[4, 3]);
        assert_eq!(narrowed.offset(), 2);
        assert_eq!(narrowed.strides(), &[6, 1]);
        assert!(layout.narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_broadcast_to_repeats() {
        // [3] broadcast to [2,3]: leading stride 0, both rows read 0,1,2.
        let layout = Layout::contiguous(Shape::from(3));
        let b = layout.broadcast_to(&Shape::from((2, 3))).unwrap();
        assert_eq!(b.strides(), &[0, 1]);
        let indices: Vec<usize> = b.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3]), 23);
        assert_eq!(layout.flat_index(&[0, 0, 0]), 0);
    }
}
