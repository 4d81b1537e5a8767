use crate::shape::Shape;

/// All errors that can occur within Quill.
///
/// One enum covers every failure mode: incompatible shapes, broadcasting
/// failures, host reads of traced values, missing devices, and the rest.
/// A single error type keeps propagation with `?` uniform across crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shapes do not match where an exact match is required
    /// (e.g. `update` values vs. the addressed region).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Two shapes cannot be broadcast together for an elementwise op.
    #[error(
        "shapes {lhs} and {rhs} are not broadcast-compatible \
         (dim {dim} from the right: {lhs_size} vs {rhs_size})"
    )]
    BroadcastError {
        lhs: Shape,
        rhs: Shape,
        dim: usize,
        lhs_size: usize,
        rhs_size: usize,
    },

    /// Host code tried to read the concrete value of a traced placeholder,
    /// typically to branch on it. Raised at trace time, never deferred.
    #[error("unsupported trace control flow: {context}")]
    UnsupportedTraceControlFlow { context: String },

    /// The requested device kind has no registered entries.
    #[error("no {kind} device available")]
    DeviceUnavailable { kind: String },

    /// Two arrays in one operation live on different devices.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: String, rhs: String },

    /// DType mismatch between arrays in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the array's rank.
    #[error("dimension out of range: dim {dim} for array with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to read a scalar out of a non-scalar array.
    #[error("not a scalar: array has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating an array from host data.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Quill.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
