//! Core array library: immutable n-dimensional arrays with recorded
//! operations, reverse-mode gradients, and logical device placement.
//!
//! Every operation returns a new [`Array`]; buffers are never mutated.
//! Arrays remember the [`Op`] that produced them, which is what the
//! gradient walk in [`backprop`] and the plan builder in the facade
//! crate consume.

pub mod array;
pub mod backprop;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod op;
pub mod shape;
pub mod storage;

pub use array::Array;
pub use backprop::{backward, GradStore};
pub use device::{devices, register_device, Device, DeviceKind};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use kernel::{BinaryOp, CmpOp, ReduceOp, UnaryOp};
pub use layout::Layout;
pub use op::{ArrayId, Index, Op};
pub use shape::Shape;
pub use storage::{Buffer, Storage};
