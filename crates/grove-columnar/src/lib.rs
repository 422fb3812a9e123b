#![forbid(unsafe_code)]

use std::mem::size_of;

use grove_types::{DType, Scalar, TypeError, cast_scalar_owned, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Packed bitmap of non-missing positions, one bit per row.
#[derive(Debug, Clone, Eq)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let len = values.len();
        let word_count = len.div_ceil(64);
        let mut words = vec![0_u64; word_count];
        for (idx, value) in values.iter().enumerate() {
            if !value.is_missing() {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Self { words, len }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.words.len() * size_of::<u64>()
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

impl PartialEq for ValidityMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bits().eq(other.bits())
    }
}

impl Serialize for ValidityMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.bits().collect();
        let mut state = serializer.serialize_struct("ValidityMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ValidityMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let len = raw.bits.len();
        let mut words = vec![0_u64; len.div_ceil(64)];
        for (idx, &valid) in raw.bits.iter().enumerate() {
            if valid {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Ok(Self { words, len })
    }
}

/// Float width targeted by [`Column::shrink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatTarget {
    #[default]
    Float32,
    Float64,
}

impl FloatTarget {
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Float32 => DType::Float32,
            Self::Float64 => DType::Float64,
        }
    }
}

const UNSIGNED_LADDER: [DType; 4] = [DType::UInt8, DType::UInt16, DType::UInt32, DType::UInt64];
const SIGNED_LADDER: [DType; 4] = [DType::Int8, DType::Int16, DType::Int32, DType::Int64];

/// Smallest integer dtype whose range holds `[min, max]`.
#[must_use]
pub fn smallest_integer_dtype(min: i64, max: i64) -> DType {
    let ladder = if min >= 0 {
        &UNSIGNED_LADDER
    } else {
        &SIGNED_LADDER
    };
    ladder
        .iter()
        .copied()
        .find(|dtype| {
            dtype
                .integer_bounds()
                .is_some_and(|(lo, hi)| lo <= min && max <= hi)
        })
        .unwrap_or(DType::Int64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("position {position} out of bounds for column of length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Construct a column, coercing values to the target dtype.
    ///
    /// Values already carrying the canonical scalar of a wide dtype are moved
    /// through untouched; narrow dtypes always range-check.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = dtype != dtype.canonical()
            || values.iter().any(|v| {
                let d = v.dtype();
                d != dtype && d != DType::Null
            });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.len() - self.validity.count_valid()
    }

    #[must_use]
    pub fn non_null_count(&self) -> usize {
        self.validity.count_valid()
    }

    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|&idx| {
                self.values
                    .get(idx)
                    .cloned()
                    .ok_or(ColumnError::PositionOutOfBounds {
                        position: idx,
                        len: self.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(self.dtype, values)
    }

    pub fn astype(&self, dtype: DType) -> Result<Self, ColumnError> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        Self::new(dtype, self.values.clone())
    }

    /// Deep memory estimate in bytes: fixed-width payload or string heap plus
    /// the validity bitmap.
    #[must_use]
    pub fn memory_usage_bytes(&self) -> usize {
        let payload = match self.dtype.byte_width() {
            Some(width) => width * self.len(),
            None => self
                .values
                .iter()
                .map(|value| match value {
                    Scalar::Utf8(s) => size_of::<String>() + s.len(),
                    _ => size_of::<String>(),
                })
                .sum(),
        };
        payload + self.validity.byte_size()
    }

    /// Re-type the column to the narrowest dtype that holds its values.
    ///
    /// Integers pick the smallest unsigned width when no value is negative,
    /// otherwise the smallest signed width. Floats move to `target`.
    pub fn shrink(&self, target: FloatTarget) -> Result<Self, ColumnError> {
        if self.dtype.is_integer() {
            let mut bounds: Option<(i64, i64)> = None;
            for value in &self.values {
                if let Scalar::Int64(v) = value {
                    bounds = Some(match bounds {
                        Some((lo, hi)) => (lo.min(*v), hi.max(*v)),
                        None => (*v, *v),
                    });
                }
            }
            let Some((min, max)) = bounds else {
                return Ok(self.clone());
            };
            return self.astype(smallest_integer_dtype(min, max));
        }

        if self.dtype.is_float() {
            return self.astype(target.dtype());
        }

        Ok(self.clone())
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}
