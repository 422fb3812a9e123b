#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical column type.
///
/// Integer widths share one value representation (`Scalar::Int64`) and float
/// widths share `Scalar::Float64`; the width only constrains the admissible
/// range and drives the memory estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
}

impl DType {
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// The widest dtype of the same family; this is the dtype reported by
    /// the scalars stored in a column of `self`.
    #[must_use]
    pub fn canonical(self) -> Self {
        if self.is_integer() {
            Self::Int64
        } else if self.is_float() {
            Self::Float64
        } else {
            self
        }
    }

    /// Bytes per value for fixed-width dtypes. `Utf8` is variable width.
    #[must_use]
    pub fn byte_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Null | Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::Utf8 => None,
        }
    }

    /// Inclusive value range of an integer dtype, expressed in the shared
    /// `i64` representation.
    #[must_use]
    pub fn integer_bounds(self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            Self::Int16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            Self::Int32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            Self::Int64 => Some((i64::MIN, i64::MAX)),
            Self::UInt8 => Some((0, i64::from(u8::MAX))),
            Self::UInt16 => Some((0, i64::from(u16::MAX))),
            Self::UInt32 => Some((0, i64::from(u32::MAX))),
            Self::UInt64 => Some((0, i64::MAX)),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null(NullKind::Null) => f.write_str("null"),
            Self::Null(NullKind::NaN) => f.write_str("NaN"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        if dtype.is_float() {
            Self::Null(NullKind::NaN)
        } else {
            Self::Null(NullKind::Null)
        }
    }

    /// Equality where every missing marker equals every other missing marker.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        if self.is_missing() || other.is_missing() {
            return self.is_missing() && other.is_missing();
        }
        self == other
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left} to {right} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast scalar of dtype {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to an integer dtype without loss")]
    LossyFloatToInt { value: f64 },
    #[error("value {value} is out of range for {dtype}")]
    IntegerOutOfRange { value: i64, dtype: DType },
    #[error("expected 0/1 for bool cast from integer but found {value}")]
    InvalidBoolInt { value: i64 },
    #[error("expected 0.0/1.0 for bool cast from float but found {value}")]
    InvalidBoolFloat { value: f64 },
}

/// Promote two dtypes to a dtype able to hold values of both.
///
/// Mixed integer widths widen to `Int64`, mixed float widths to `Float64`.
pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64, Null};

    if left == right {
        return Ok(left);
    }

    let out = match (left.canonical(), right.canonical()) {
        (Null, _) => right,
        (_, Null) => left,
        (a, b) if a == b => a,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype(values: &[Scalar]) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

fn checked_integer(value: i64, target: DType) -> Result<Scalar, TypeError> {
    match target.integer_bounds() {
        Some((lo, hi)) if value < lo || value > hi => Err(TypeError::IntegerOutOfRange {
            value,
            dtype: target,
        }),
        _ => Ok(Scalar::Int64(value)),
    }
}

fn round_to_width(value: f64, target: DType) -> f64 {
    if matches!(target, DType::Float32) {
        f64::from(value as f32)
    } else {
        value
    }
}

/// Cast a scalar to a target dtype, taking ownership so values that already
/// match are passed through without cloning.
pub fn cast_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if value.is_missing() {
        return Ok(Scalar::missing_for_dtype(target));
    }
    if from == target {
        return Ok(value);
    }

    if target.is_integer() {
        return match value {
            Scalar::Int64(v) => checked_integer(v, target),
            Scalar::Bool(v) => checked_integer(i64::from(v), target),
            Scalar::Float64(v) => {
                if !v.is_finite() || v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: v });
                }
                if v < i64::MIN as f64 || v > i64::MAX as f64 {
                    return Err(TypeError::LossyFloatToInt { value: v });
                }
                checked_integer(v as i64, target)
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        };
    }

    if target.is_float() {
        return match value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(round_to_width(v as f64, target))),
            Scalar::Float64(v) => Ok(Scalar::Float64(round_to_width(v, target))),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        };
    }

    match target {
        DType::Null => Ok(Scalar::Null(NullKind::Null)),
        DType::Bool => match value {
            Scalar::Int64(v) => match v {
                0 => Ok(Scalar::Bool(false)),
                1 => Ok(Scalar::Bool(true)),
                _ => Err(TypeError::InvalidBoolInt { value: v }),
            },
            Scalar::Float64(v) => {
                if v == 0.0 {
                    Ok(Scalar::Bool(false))
                } else if v == 1.0 {
                    Ok(Scalar::Bool(true))
                } else {
                    Err(TypeError::InvalidBoolFloat { value: v })
                }
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        _ => Err(TypeError::InvalidCast { from, to: target }),
    }
}

/// Cast a scalar reference to a target dtype (clones only when conversion is needed).
pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    cast_scalar_owned(value.clone(), target)
}

#[cfg(test)]
mod tests {
    use super::{DType, NullKind, Scalar, TypeError, cast_scalar, common_dtype, infer_dtype};

    #[test]
    fn dtype_inference_coerces_numeric_values() {
        let values = vec![Scalar::Bool(true), Scalar::Int64(7), Scalar::Float64(3.5)];
        assert_eq!(
            infer_dtype(&values).expect("dtype should infer"),
            DType::Float64
        );
    }

    #[test]
    fn missing_values_get_target_missing_marker() {
        let missing = Scalar::Null(NullKind::Null);
        let cast = cast_scalar(&missing, DType::Float32).expect("missing casts");
        assert_eq!(cast, Scalar::Null(NullKind::NaN));
        let cast = cast_scalar(&missing, DType::UInt8).expect("missing casts");
        assert_eq!(cast, Scalar::Null(NullKind::Null));
    }

    #[test]
    fn semantic_eq_treats_all_missing_markers_as_equal() {
        assert!(Scalar::Float64(f64::NAN).semantic_eq(&Scalar::Null(NullKind::NaN)));
        assert!(Scalar::Null(NullKind::Null).semantic_eq(&Scalar::Null(NullKind::NaN)));
        assert!(!Scalar::Int64(1).semantic_eq(&Scalar::Null(NullKind::Null)));
    }

    #[test]
    fn common_dtype_rejects_string_numeric_mix() {
        let err = common_dtype(DType::Utf8, DType::Int64).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "dtype coercion from utf8 to int64 has no compatible common type"
        );
    }

    #[test]
    fn common_dtype_widens_mixed_integer_widths() {
        assert_eq!(
            common_dtype(DType::UInt8, DType::Int32).expect("ints"),
            DType::Int64
        );
        assert_eq!(
            common_dtype(DType::Float32, DType::Int16).expect("mixed"),
            DType::Float64
        );
        assert_eq!(
            common_dtype(DType::Null, DType::UInt16).expect("null"),
            DType::UInt16
        );
        assert_eq!(
            common_dtype(DType::Float32, DType::Float32).expect("same"),
            DType::Float32
        );
    }

    #[test]
    fn narrow_integer_cast_checks_range() {
        assert_eq!(
            cast_scalar(&Scalar::Int64(255), DType::UInt8).expect("fits"),
            Scalar::Int64(255)
        );
        assert_eq!(
            cast_scalar(&Scalar::Int64(256), DType::UInt8),
            Err(TypeError::IntegerOutOfRange {
                value: 256,
                dtype: DType::UInt8
            })
        );
        assert!(cast_scalar(&Scalar::Int64(-1), DType::UInt32).is_err());
        assert!(cast_scalar(&Scalar::Int64(-128), DType::Int8).is_ok());
    }

    #[test]
    fn float32_cast_rounds_through_single_precision() {
        let cast = cast_scalar(&Scalar::Float64(0.1), DType::Float32).expect("float32");
        assert_eq!(cast, Scalar::Float64(f64::from(0.1_f32)));
    }

    #[test]
    fn lossy_float_to_int_is_rejected() {
        assert!(matches!(
            cast_scalar(&Scalar::Float64(1.5), DType::Int32),
            Err(TypeError::LossyFloatToInt { .. })
        ));
        assert_eq!(
            cast_scalar(&Scalar::Float64(2.0), DType::Int16).expect("whole"),
            Scalar::Int64(2)
        );
    }

    #[test]
    fn canonical_and_widths_line_up() {
        assert_eq!(DType::UInt16.canonical(), DType::Int64);
        assert_eq!(DType::Float32.canonical(), DType::Float64);
        assert_eq!(DType::Utf8.canonical(), DType::Utf8);
        assert_eq!(DType::UInt16.byte_width(), Some(2));
        assert_eq!(DType::Utf8.byte_width(), None);
        assert_eq!(DType::Int8.integer_bounds(), Some((-128, 127)));
    }
}
