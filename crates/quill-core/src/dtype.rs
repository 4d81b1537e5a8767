use std::fmt;

// DType — Supported element data types
//
// Every array carries a DType that determines element width and numeric
// behavior:
//
//   F32  — 32-bit float, the default
//   F64  — 64-bit float, for high-precision work and gradient checking
//   I32  — signed 32-bit int
//   I64  — signed 64-bit int, for indices and labels
//   Bool — comparison results and select masks

/// Enum of all supported element data types.
///
/// Stored inside every array so operations can dispatch to the correct
/// typed buffer at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type (required for gradients).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Whether this dtype supports arithmetic (everything except Bool).
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DType::Bool)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

/// Trait implemented by Rust types that can be stored in an array.
///
/// Bridges the concrete Rust type to the DType enum and provides the
/// f64 conversions the generic kernels compute through.
pub trait WithDType: Copy + Send + Sync + 'static + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// The zero value.
    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    /// The one value.
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

impl WithDType for bool {
    const DTYPE: DType = DType::Bool;
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_is_float() {
        assert!(DType::F32.is_float());
        assert!(DType::F64.is_float());
        assert!(!DType::I32.is_float());
        assert!(!DType::Bool.is_float());
    }

    #[test]
    fn test_with_dtype_roundtrip() {
        let v: f64 = 42.0;
        assert_eq!(f64::from_f64(v).to_f64(), v);
        assert_eq!(i64::from_f64(v).to_f64(), v);
        assert_eq!(i32::from_f64(v).to_f64(), v);
        assert!(bool::from_f64(1.0));
        assert!(!bool::from_f64(0.0));
    }
}
