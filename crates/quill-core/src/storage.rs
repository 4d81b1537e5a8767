use std::sync::{Arc, Condvar, Mutex};

use crate::dtype::{DType, WithDType};
use crate::shape::Shape;

// Storage — dtype-tagged flat buffers behind a fill-once slot
//
// A Buffer is the owned data of one array: a flat Vec in the array's
// element type. Buffers are never mutated after construction; every
// operation allocates a fresh one.
//
// Storage wraps the buffer in a slot that may be *pending*: a device
// transfer produces its buffer from a worker thread, and any reader that
// needs the materialized value blocks on a condvar until the slot is
// filled. Arrays created directly start out ready.

/// Flat, owned element data for one array.
#[derive(Debug, Clone)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl Buffer {
    /// The element dtype of this buffer.
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I32(_) => DType::I32,
            Buffer::I64(_) => DType::I64,
            Buffer::Bool(_) => DType::Bool,
        }
    }

    /// Number of elements held.
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::I32(v) => v.len(),
            Buffer::I64(v) => v.len(),
            Buffer::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer of `shape.elem_count()` elements all equal to `val`
    /// (converted into `dtype`).
    pub fn full(shape: &Shape, val: f64, dtype: DType) -> Buffer {
        let n = shape.elem_count();
        match dtype {
            DType::F32 => Buffer::F32(vec![f32::from_f64(val); n]),
            DType::F64 => Buffer::F64(vec![val; n]),
            DType::I32 => Buffer::I32(vec![i32::from_f64(val); n]),
            DType::I64 => Buffer::I64(vec![i64::from_f64(val); n]),
            DType::Bool => Buffer::Bool(vec![bool::from_f64(val); n]),
        }
    }

    pub fn zeros(shape: &Shape, dtype: DType) -> Buffer {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: &Shape, dtype: DType) -> Buffer {
        Self::full(shape, 1.0, dtype)
    }

    /// Build a buffer from f64 host values, converting into `dtype`.
    pub fn from_f64_slice(data: &[f64], dtype: DType) -> Buffer {
        match dtype {
            DType::F32 => Buffer::F32(data.iter().map(|&v| f32::from_f64(v)).collect()),
            DType::F64 => Buffer::F64(data.to_vec()),
            DType::I32 => Buffer::I32(data.iter().map(|&v| i32::from_f64(v)).collect()),
            DType::I64 => Buffer::I64(data.iter().map(|&v| i64::from_f64(v)).collect()),
            DType::Bool => Buffer::Bool(data.iter().map(|&v| bool::from_f64(v)).collect()),
        }
    }

    /// Read the element at a flat position as f64.
    pub fn get_f64(&self, idx: usize) -> f64 {
        match self {
            Buffer::F32(v) => v[idx].to_f64(),
            Buffer::F64(v) => v[idx],
            Buffer::I32(v) => v[idx].to_f64(),
            Buffer::I64(v) => v[idx].to_f64(),
            Buffer::Bool(v) => v[idx].to_f64(),
        }
    }
}

/// Shared handle to a buffer that may still be in flight.
///
/// Cloning is cheap (Arc). `wait_with` blocks until the buffer exists,
/// which is how "reading an array implicitly waits for pending transfers"
/// is implemented.
#[derive(Clone)]
pub struct Storage {
    cell: Arc<Cell>,
}

struct Cell {
    slot: Mutex<Option<Buffer>>,
    ready: Condvar,
}

impl Storage {
    /// Storage whose buffer is available immediately.
    pub fn ready(buffer: Buffer) -> Self {
        Storage {
            cell: Arc::new(Cell {
                slot: Mutex::new(Some(buffer)),
                ready: Condvar::new(),
            }),
        }
    }

    /// Storage whose buffer will be produced later by `fulfill`.
    pub fn pending() -> Self {
        Storage {
            cell: Arc::new(Cell {
                slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Fill a pending slot and wake all waiters. Filling twice is a
    /// logic error and panics.
    pub fn fulfill(&self, buffer: Buffer) {
        let mut slot = self.cell.slot.lock().expect("storage lock poisoned");
        assert!(slot.is_none(), "storage slot fulfilled twice");
        *slot = Some(buffer);
        self.cell.ready.notify_all();
    }

    /// Whether the buffer has materialized (non-blocking).
    pub fn is_ready(&self) -> bool {
        self.cell
            .slot
            .lock()
            .expect("storage lock poisoned")
            .is_some()
    }

    /// Block until the buffer is available, then run `f` on it.
    pub fn wait_with<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        let mut slot = self.cell.slot.lock().expect("storage lock poisoned");
        while slot.is_none() {
            slot = self
                .cell
                .ready
                .wait(slot)
                .expect("storage lock poisoned");
        }
        f(slot.as_ref().expect("slot checked non-empty"))
    }

    /// Block until the buffer is available and clone it out.
    pub fn wait_clone(&self) -> Buffer {
        self.wait_with(|b| b.clone())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ready() {
            self.wait_with(|b| write!(f, "Storage({:?}, len={})", b.dtype(), b.len()))
        } else {
            write!(f, "Storage(pending)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_get() {
        let b = Buffer::full(&Shape::from((2, 2)), 3.0, DType::I64);
        assert_eq!(b.len(), 4);
        assert_eq!(b.get_f64(3), 3.0);
        assert_eq!(b.dtype(), DType::I64);
    }

    #[test]
    fn test_ready_storage() {
        let s = Storage::ready(Buffer::ones(&Shape::from(3), DType::F32));
        assert!(s.is_ready());
        assert_eq!(s.wait_with(|b| b.len()), 3);
    }

    #[test]
    fn test_pending_fulfilled_from_thread() {
        let s = Storage::pending();
        assert!(!s.is_ready());
        let s2 = s.clone();
        let handle = std::thread::spawn(move || {
            s2.fulfill(Buffer::full(&Shape::from(2), 7.0, DType::F64));
        });
        // wait_with blocks until the worker fills the slot.
        assert_eq!(s.wait_with(|b| b.get_f64(0)), 7.0);
        handle.join().unwrap();
    }
}
