//! quill — a small functional array library: immutable n-dimensional
//! arrays, reverse-mode gradients, a compilation plan cache, and a
//! stateless keyed PRNG.
//!
//! ```
//! use quill::prelude::*;
//!
//! let f = |xs: &[Array]| xs[0].square()?.sum_all();
//! let df = gradient(f, &[0]);
//! let x = Array::full((), 3.0, DType::F64);
//! assert_eq!(df(&[x]).unwrap()[0].to_scalar().unwrap(), 6.0);
//! ```

pub mod grad;
pub mod jit;
pub mod rng;

pub use grad::{gradient, value_and_gradient};
pub use jit::{compile, CompileStats, Compiled, StaticArg};
pub use rng::{make_key, sample, split, Dist, Key};

pub use quill_core::{
    backward, devices, register_device, Array, ArrayId, DType, Device, DeviceKind, Error,
    GradStore, Index, Result, Shape,
};

/// The commonly used surface in one import.
pub mod prelude {
    pub use crate::grad::{gradient, value_and_gradient};
    pub use crate::jit::{compile, CompileStats, StaticArg};
    pub use crate::rng::{make_key, sample, split, Dist, Key};
    pub use quill_core::{
        devices, register_device, Array, DType, Device, DeviceKind, Error, Index, Result, Shape,
    };
}
