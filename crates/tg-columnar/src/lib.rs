#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tg_types::{coerce_scalar_owned, common_dtype, infer_dtype, DType, Scalar, TypeError};

/// Packed validity bitmask: bit set means the position holds a non-missing
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
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
}

/// Comparison operators over scalars; the filter engine's building block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("cannot concatenate zero column fragments")]
    EmptyConcat,
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Ordering of two non-missing scalars: textual values compare
/// lexicographically, timestamps by epoch, numerics through f64.
#[must_use]
pub fn scalar_cmp(left: &Scalar, right: &Scalar) -> Option<Ordering> {
    match (left, right) {
        (Scalar::Utf8(a), Scalar::Utf8(b)) => Some(a.cmp(b)),
        (Scalar::Timestamp(a), Scalar::Timestamp(b)) => Some(a.cmp(b)),
        _ => {
            let lhs = left.to_f64().ok()?;
            let rhs = right.to_f64().ok()?;
            lhs.partial_cmp(&rhs)
        }
    }
}

fn scalar_matches(value: &Scalar, probe: &Scalar, op: ComparisonOp) -> bool {
    let Some(ordering) = scalar_cmp(value, probe) else {
        return false;
    };
    match op {
        ComparisonOp::Eq => ordering == Ordering::Equal,
        ComparisonOp::Gt => ordering == Ordering::Greater,
        ComparisonOp::Lt => ordering == Ordering::Less,
        ComparisonOp::Ge => ordering != Ordering::Less,
        ComparisonOp::Le => ordering != Ordering::Greater,
    }
}

/// Hashable identity for distinct counting. Float64 keys by bit pattern,
/// with all NaNs collapsing to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScalarKey {
    Int(i64),
    Float(u64),
    Str(String),
    Ts(i64),
}

impl ScalarKey {
    fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Null => None,
            Scalar::Int64(v) => Some(Self::Int(*v)),
            Scalar::Float64(v) => Some(Self::Float(v.to_bits())),
            Scalar::Utf8(v) => Some(Self::Str(v.clone())),
            Scalar::Timestamp(v) => Some(Self::Ts(*v)),
        }
    }
}

/// A typed column: contiguous scalar buffer plus validity. Construction
/// coerces every value to the declared dtype or fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

impl Column {
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null && !(dtype == DType::Categorical && d == DType::Utf8)
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| coerce_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
        };

        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values).map_err(ColumnError::from)?;
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

    /// Retag a column without touching its buffer. Valid only for
    /// Utf8 <-> Categorical, which share the payload representation.
    pub fn retag(self, dtype: DType) -> Result<Self, ColumnError> {
        if self.dtype == dtype {
            return Ok(self);
        }
        if self.dtype.is_textual() && dtype.is_textual() {
            return Ok(Self { dtype, ..self });
        }
        Err(ColumnError::Type(TypeError::InvalidCast {
            from: self.dtype,
            to: dtype,
        }))
    }

    /// Gather rows by position, preserving the given order. Out-of-range
    /// positions become nulls (callers pass positions from the same
    /// dataset, so this is a belt only).
    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        let values: Vec<Scalar> = positions
            .iter()
            .map(|&idx| self.values.get(idx).cloned().unwrap_or(Scalar::Null))
            .collect();
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype: self.dtype,
            values,
            validity,
        }
    }

    /// Logical concatenation of fragments into one column. Dtypes must
    /// share a common type (all-null fragments yield to the other side).
    pub fn concat(parts: &[Self]) -> Result<Self, ColumnError> {
        let first = parts.first().ok_or(ColumnError::EmptyConcat)?;
        let mut dtype = first.dtype;
        for part in &parts[1..] {
            dtype = common_dtype(dtype, part.dtype).map_err(ColumnError::from)?;
        }
        let values: Vec<Scalar> = parts
            .iter()
            .flat_map(|part| part.values.iter().cloned())
            .collect();
        Self::new(dtype, values)
    }

    /// Per-row comparison against a probe scalar. Missing values never
    /// match, regardless of operator.
    #[must_use]
    pub fn matches_scalar(&self, probe: &Scalar, op: ComparisonOp) -> Vec<bool> {
        self.values
            .iter()
            .map(|value| !value.is_missing() && scalar_matches(value, probe, op))
            .collect()
    }

    /// Per-row membership against a probe set. Missing values never match.
    #[must_use]
    pub fn matches_any(&self, probes: &[Scalar]) -> Vec<bool> {
        self.values
            .iter()
            .map(|value| {
                !value.is_missing() && probes.iter().any(|probe| value.semantic_eq(probe))
            })
            .collect()
    }
}

/// Derived per-column statistics, computed in one pass plus a distinct set.
/// Memoized by the store; invalidated only by a full reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub dtype: DType,
    pub non_null_count: usize,
    pub null_count: usize,
    pub distinct_count: usize,
    pub min: Option<Scalar>,
    pub max: Option<Scalar>,
    /// Arithmetic mean; present only for numeric and timestamp columns.
    pub mean: Option<f64>,
}

impl ColumnStats {
    #[must_use]
    pub fn compute(column: &Column) -> Self {
        let mut distinct: HashSet<ScalarKey> = HashSet::new();
        let mut min: Option<Scalar> = None;
        let mut max: Option<Scalar> = None;
        let mut sum = 0.0_f64;
        let mut non_null = 0_usize;

        for value in column.values() {
            if value.is_missing() {
                continue;
            }
            non_null += 1;
            if let Some(key) = ScalarKey::from_scalar(value) {
                distinct.insert(key);
            }
            match &min {
                Some(current) if scalar_cmp(value, current) != Some(Ordering::Less) => {}
                _ => min = Some(value.clone()),
            }
            match &max {
                Some(current) if scalar_cmp(value, current) != Some(Ordering::Greater) => {}
                _ => max = Some(value.clone()),
            }
            if let Ok(v) = value.to_f64() {
                sum += v;
            }
        }

        let mean = if non_null > 0
            && (column.dtype().is_numeric() || column.dtype() == DType::Timestamp)
        {
            Some(sum / non_null as f64)
        } else {
            None
        };

        Self {
            dtype: column.dtype(),
            non_null_count: non_null,
            null_count: column.len() - non_null,
            distinct_count: distinct.len(),
            min,
            max,
            mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Column, ColumnError, ColumnStats, ComparisonOp, ValidityMask};
    use tg_types::{DType, Scalar};

    fn int_column(values: &[Option<i64>]) -> Column {
        let scalars: Vec<Scalar> = values
            .iter()
            .map(|v| v.map_or(Scalar::Null, Scalar::Int64))
            .collect();
        Column::new(DType::Int64, scalars).expect("column")
    }

    #[test]
    fn validity_mask_counts_across_word_boundaries() {
        let values: Vec<Scalar> = (0..130)
            .map(|i| {
                if i % 3 == 0 {
                    Scalar::Null
                } else {
                    Scalar::Int64(i)
                }
            })
            .collect();
        let mask = ValidityMask::from_values(&values);
        let expected = values.iter().filter(|v| !v.is_missing()).count();
        assert_eq!(mask.count_valid(), expected);
        assert!(!mask.get(0));
        assert!(mask.get(1));
        assert!(!mask.get(200));
    }

    #[test]
    fn construction_coerces_values_to_declared_dtype() {
        let column = Column::new(
            DType::Float64,
            vec![Scalar::Int64(1), Scalar::Utf8("2.5".into()), Scalar::Null],
        )
        .expect("column");
        assert_eq!(column.values()[0], Scalar::Float64(1.0));
        assert_eq!(column.values()[1], Scalar::Float64(2.5));
        assert_eq!(column.null_count(), 1);
    }

    #[test]
    fn construction_fails_on_uncoercible_value() {
        let result = Column::new(DType::Int64, vec![Scalar::Utf8("abc".into())]);
        assert!(matches!(result, Err(ColumnError::Type(_))));
    }

    #[test]
    fn matches_scalar_skips_nulls() {
        let column = int_column(&[Some(1), None, Some(3), Some(2)]);
        let mask = column.matches_scalar(&Scalar::Int64(2), ComparisonOp::Ge);
        assert_eq!(mask, vec![false, false, true, true]);
    }

    #[test]
    fn matches_any_is_order_insensitive() {
        let column = int_column(&[Some(1), Some(2), None, Some(4)]);
        let forward = column.matches_any(&[Scalar::Int64(1), Scalar::Int64(4)]);
        let reversed = column.matches_any(&[Scalar::Int64(4), Scalar::Int64(1)]);
        assert_eq!(forward, reversed);
        assert_eq!(forward, vec![true, false, false, true]);
    }

    #[test]
    fn take_preserves_requested_order() {
        let column = int_column(&[Some(10), Some(20), Some(30)]);
        let taken = column.take(&[2, 0]);
        assert_eq!(taken.values(), &[Scalar::Int64(30), Scalar::Int64(10)]);
    }

    #[test]
    fn concat_unifies_dtypes_and_preserves_row_order() {
        let a = Column::new(DType::Int64, vec![Scalar::Int64(1)]).expect("a");
        let b = Column::new(DType::Null, vec![Scalar::Null, Scalar::Null]).expect("b");
        let c = Column::new(DType::Float64, vec![Scalar::Float64(2.5)]).expect("c");
        let merged = Column::concat(&[a, b, c]).expect("concat");
        assert_eq!(merged.dtype(), DType::Float64);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.values()[0], Scalar::Float64(1.0));
        assert_eq!(merged.values()[3], Scalar::Float64(2.5));
    }

    #[test]
    fn concat_of_nothing_is_an_error() {
        assert!(matches!(Column::concat(&[]), Err(ColumnError::EmptyConcat)));
    }

    #[test]
    fn stats_cover_counts_bounds_and_mean() {
        let column = int_column(&[Some(10), Some(20), None, Some(10)]);
        let stats = ColumnStats::compute(&column);
        assert_eq!(stats.non_null_count, 3);
        assert_eq!(stats.null_count, 1);
        assert_eq!(stats.distinct_count, 2);
        assert_eq!(stats.min, Some(Scalar::Int64(10)));
        assert_eq!(stats.max, Some(Scalar::Int64(20)));
        let mean = stats.mean.expect("mean");
        assert!((mean - 40.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn stats_on_all_null_column_are_zeroed() {
        let column = Column::new(DType::Float64, vec![Scalar::Null, Scalar::Null]).expect("col");
        let stats = ColumnStats::compute(&column);
        assert_eq!(stats.non_null_count, 0);
        assert_eq!(stats.distinct_count, 0);
        assert_eq!(stats.min, None);
        assert_eq!(stats.mean, None);
    }

    #[test]
    fn textual_stats_have_no_mean() {
        let column = Column::new(
            DType::Categorical,
            vec![Scalar::Utf8("a".into()), Scalar::Utf8("b".into())],
        )
        .expect("col");
        let stats = ColumnStats::compute(&column);
        assert_eq!(stats.mean, None);
        assert_eq!(stats.min, Some(Scalar::Utf8("a".into())));
    }

    #[test]
    fn retag_swaps_textual_tags_only() {
        let column = Column::new(DType::Utf8, vec![Scalar::Utf8("x".into())]).expect("col");
        let tagged = column.retag(DType::Categorical).expect("retag");
        assert_eq!(tagged.dtype(), DType::Categorical);
        assert!(tagged.retag(DType::Int64).is_err());
    }
}
