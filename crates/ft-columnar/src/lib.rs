#![forbid(unsafe_code)]

use std::ops::Range;

use ft_types::{
    ColumnType, ConverterRegistry, DType, PARSE_ORDER, Scalar, TypeError, cast_scalar_owned,
    common_supertype, infer_dtype, parse_scalar,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Packed validity bitmap: bit `i` is set when value `i` is present.
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
        let full_words = self.len / 64;
        let mut count: u32 = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones())
            .sum();
        let remainder = self.len % 64;
        if remainder > 0 && full_words < self.words.len() {
            let mask = (1_u64 << remainder) - 1;
            count += (self.words[full_words] & mask).count_ones();
        }
        count as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
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
        let word_count = len.div_ceil(64);
        let mut words = vec![0_u64; word_count];
        for (idx, &valid) in raw.bits.iter().enumerate() {
            if valid {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Ok(Self { words, len })
    }
}

/// Storage of a value column: element type, values and validity.
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
    #[error("row position {position} out of bounds for length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Construct a column, coercing values along the type lattice.
    /// Takes ownership so values that already match skip the clone.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = values.iter().any(|v| !v.is_null() && v.dtype() != dtype);

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, &dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(&dtype),
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
        let dtype = infer_dtype(&values);
        Self::new(dtype, values)
    }

    /// A column of `len` missing values.
    #[must_use]
    pub fn nulls(dtype: DType, len: usize) -> Self {
        let values = vec![Scalar::missing_for_dtype(&dtype); len];
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype,
            values,
            validity,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        ColumnType::new(self.dtype.clone(), self.has_nulls())
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
    pub fn has_nulls(&self) -> bool {
        self.null_count() > 0
    }

    /// Gather values at `positions`, in that order.
    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|&position| {
                self.values
                    .get(position)
                    .cloned()
                    .ok_or(ColumnError::PositionOutOfBounds {
                        position,
                        len: self.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let validity = ValidityMask::from_values(&values);
        Ok(Self {
            dtype: self.dtype.clone(),
            values,
            validity,
        })
    }

    /// Contiguous row range; the range is clamped to the column length.
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        let values = self.values[start..end].to_vec();
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype: self.dtype.clone(),
            values,
            validity,
        }
    }

    /// Keep elements whose mask entry is `true`.
    pub fn filter_by_mask(&self, mask: &[bool]) -> Result<Self, ColumnError> {
        if self.len() != mask.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: mask.len(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(mask)
            .filter_map(|(value, keep)| keep.then(|| value.clone()))
            .collect::<Vec<_>>();
        let validity = ValidityMask::from_values(&values);
        Ok(Self {
            dtype: self.dtype.clone(),
            values,
            validity,
        })
    }

    /// Vertical concatenation; the result type is the supertype of all parts.
    pub fn concat(parts: &[&Self]) -> Result<Self, ColumnError> {
        let dtype = common_supertype(parts.iter().map(|part| &part.dtype));
        let values = parts
            .iter()
            .flat_map(|part| part.values.iter().cloned())
            .collect();
        Self::new(dtype, values)
    }

    /// Convert every element to `target`.
    ///
    /// A subtype target only relabels the column. Otherwise each present value
    /// goes through the registry's `(dtype, target)` converter; the first
    /// failing element aborts the cast.
    pub fn cast_with(&self, target: &DType, registry: &ConverterRegistry) -> Result<Self, ColumnError> {
        if self.dtype.is_subtype_of(target) {
            return Self::new(target.clone(), self.values.clone());
        }
        let converted = self
            .values
            .iter()
            .map(|value| registry.convert(value, target))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(target.clone(), converted)
    }

    /// Re-type a text column with the narrowest parser accepting every
    /// present value. Non-text columns and unparsable text come back unchanged.
    #[must_use]
    pub fn parse_guess(&self) -> Self {
        if self.dtype != DType::Utf8 {
            return self.clone();
        }
        for target in &PARSE_ORDER {
            let parsed = self
                .values
                .iter()
                .map(|value| match value {
                    Scalar::Utf8(text) => parse_scalar(text, target),
                    other => Ok(other.clone()),
                })
                .collect::<Result<Vec<_>, _>>();
            if let Ok(values) = parsed {
                if let Ok(column) = Self::new(target.clone(), values) {
                    return column;
                }
            }
        }
        self.clone()
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}
