use bytemuck::Pod;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
}

impl DType {
    /// Get the size in bytes of this data type
    pub const fn size(&self) -> usize {
        match self {
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::F16 | DType::BF16 | DType::I16 | DType::U16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::Bool => "bool",
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub const fn is_int(&self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 | DType::U8 | DType::U16 | DType::U32 | DType::U64
        )
    }

    /// Everything except `Bool` supports arithmetic and `fill_`
    pub const fn is_numeric(&self) -> bool {
        !matches!(self, DType::Bool)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A numeric scalar stored in tensor buffers.
///
/// Integer arithmetic wraps; half-precision types compute through `f32`
/// and round back after every operation.
pub trait Element: Pod + PartialOrd + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn zero() -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    /// `None` for integer division by zero
    fn checked_div(self, rhs: Self) -> Option<Self>;
    fn neg(self) -> Self;
    fn abs(self) -> Self;

    fn maximum(self, rhs: Self) -> Self {
        if rhs > self {
            rhs
        } else {
            self
        }
    }

    fn minimum(self, rhs: Self) -> Self {
        if rhs < self {
            rhs
        } else {
            self
        }
    }

    fn exp(self) -> Self {
        Self::from_f64(self.to_f64().exp())
    }

    fn sqrt(self) -> Self {
        Self::from_f64(self.to_f64().sqrt())
    }
}

macro_rules! impl_float_element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                0.0
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                Some(self / rhs)
            }
            fn neg(self) -> Self {
                -self
            }
            fn abs(self) -> Self {
                <$t>::abs(self)
            }
            fn exp(self) -> Self {
                <$t>::exp(self)
            }
            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }
        }
    };
}

macro_rules! impl_half_element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                <$t>::ZERO
            }
            fn to_f64(self) -> f64 {
                <$t>::to_f64(self)
            }
            fn from_f64(v: f64) -> Self {
                <$t>::from_f64(v)
            }
            fn add(self, rhs: Self) -> Self {
                <$t>::from_f32(self.to_f32() + rhs.to_f32())
            }
            fn sub(self, rhs: Self) -> Self {
                <$t>::from_f32(self.to_f32() - rhs.to_f32())
            }
            fn mul(self, rhs: Self) -> Self {
                <$t>::from_f32(self.to_f32() * rhs.to_f32())
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                Some(<$t>::from_f32(self.to_f32() / rhs.to_f32()))
            }
            fn neg(self) -> Self {
                -self
            }
            fn abs(self) -> Self {
                <$t>::from_f32(self.to_f32().abs())
            }
        }
    };
}

macro_rules! impl_signed_element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                0
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                if rhs == 0 {
                    None
                } else {
                    Some(self.wrapping_div(rhs))
                }
            }
            fn neg(self) -> Self {
                self.wrapping_neg()
            }
            fn abs(self) -> Self {
                self.wrapping_abs()
            }
        }
    };
}

macro_rules! impl_unsigned_element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                0
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn checked_div(self, rhs: Self) -> Option<Self> {
                <$t>::checked_div(self, rhs)
            }
            fn neg(self) -> Self {
                self.wrapping_neg()
            }
            fn abs(self) -> Self {
                self
            }
        }
    };
}

impl_float_element!(f32, F32);
impl_float_element!(f64, F64);
impl_half_element!(f16, F16);
impl_half_element!(bf16, BF16);
impl_signed_element!(i8, I8);
impl_signed_element!(i16, I16);
impl_signed_element!(i32, I32);
impl_signed_element!(i64, I64);
impl_unsigned_element!(u8, U8);
impl_unsigned_element!(u16, U16);
impl_unsigned_element!(u32, U32);
impl_unsigned_element!(u64, U64);

/// Run `$body` with `$T` bound to the element type of `$dtype`.
///
/// `$body` must evaluate to a `RuntimeResult`; `Bool` yields
/// `UnsupportedDType` tagged with `$op`.
macro_rules! with_element_type {
    ($dtype:expr, $op:expr, $T:ident => $body:expr) => {{
        use $crate::tensor::dtype::DType as __DType;
        match $dtype {
            __DType::F16 => {
                type $T = half::f16;
                $body
            }
            __DType::BF16 => {
                type $T = half::bf16;
                $body
            }
            __DType::F32 => {
                type $T = f32;
                $body
            }
            __DType::F64 => {
                type $T = f64;
                $body
            }
            __DType::I8 => {
                type $T = i8;
                $body
            }
            __DType::I16 => {
                type $T = i16;
                $body
            }
            __DType::I32 => {
                type $T = i32;
                $body
            }
            __DType::I64 => {
                type $T = i64;
                $body
            }
            __DType::U8 => {
                type $T = u8;
                $body
            }
            __DType::U16 => {
                type $T = u16;
                $body
            }
            __DType::U32 => {
                type $T = u32;
                $body
            }
            __DType::U64 => {
                type $T = u64;
                $body
            }
            __DType::Bool => Err($crate::error::RuntimeError::unsupported_dtype(__DType::Bool, $op)),
        }
    }};
}

pub(crate) use with_element_type;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RuntimeError, RuntimeResult};

    #[test]
    fn test_sizes_and_names() {
        assert_eq!(DType::F32.size(), 4);
        assert_eq!(DType::BF16.size(), 2);
        assert_eq!(DType::U64.size(), 8);
        assert_eq!(DType::Bool.size(), 1);
        assert_eq!(DType::F32.name(), "float32");
        assert_eq!(DType::I64.to_string(), "int64");
    }

    #[test]
    fn test_classification() {
        assert!(DType::F16.is_float());
        assert!(!DType::F16.is_int());
        assert!(DType::U8.is_int());
        assert!(DType::U8.is_numeric());
        assert!(!DType::Bool.is_numeric());
        assert!(!DType::Bool.is_int());
    }

    #[test]
    fn test_integer_semantics() {
        assert_eq!(Element::add(i8::MAX, 1), i8::MIN);
        assert_eq!(Element::checked_div(7i32, 0), None);
        assert_eq!(Element::checked_div(7i32, 2), Some(3));
        assert_eq!(Element::abs(-4i16), 4);
        assert_eq!(<u8 as Element>::from_f64(300.0), 255);
    }

    #[test]
    fn test_half_roundtrip() {
        let x = <f16 as Element>::from_f64(1.5);
        let y = Element::add(x, x);
        assert_eq!(y.to_f64(), 3.0);
        assert_eq!(<bf16 as Element>::DTYPE, DType::BF16);
    }

    fn element_size(dtype: DType) -> RuntimeResult<usize> {
        with_element_type!(dtype, "element_size", T => Ok(std::mem::size_of::<T>()))
    }

    #[test]
    fn test_dispatch_macro() {
        for dtype in [DType::F16, DType::F32, DType::F64, DType::I8, DType::U32, DType::I64] {
            assert_eq!(element_size(dtype).unwrap(), dtype.size());
        }
        assert!(matches!(
            element_size(DType::Bool),
            Err(RuntimeError::UnsupportedDType { .. })
        ));
    }
}
