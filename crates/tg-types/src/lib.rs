#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared column types. `Categorical` is a schema-level tag over Utf8
/// payloads: values compare like strings, but the tag marks the column as
/// low-cardinality for cheap equality/membership tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Int64,
    Float64,
    Utf8,
    Categorical,
    Timestamp,
}

impl DType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Utf8 | Self::Categorical)
    }
}

/// A single typed value. Timestamps carry epoch seconds (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Timestamp(i64),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null => DType::Null,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Timestamp(_) => DType::Timestamp,
        }
    }

    /// Null or NaN both count as missing.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Equality that treats NaN as equal to NaN, so membership tests and
    /// distinct counts behave deterministically.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || a == b,
            _ => self == other,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Timestamp(v) => Ok(*v as f64),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }

    /// Human-readable rendering used for group keys, `contains` matching
    /// and unique-value maps. Timestamps render as ISO datetime.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Self::Null => String::from("null"),
            Self::Int64(v) => v.to_string(),
            Self::Float64(v) => v.to_string(),
            Self::Utf8(v) => v.clone(),
            Self::Timestamp(v) => format_timestamp(*v),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtypes {left:?} and {right:?} have no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast scalar of dtype {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("cannot parse {value:?} as {dtype:?}")]
    UnparseableValue { value: String, dtype: DType },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing")]
    ValueIsMissing,
}

/// Widest common dtype of two columns' values. Int64 promotes to Float64 on
/// mix; Categorical and Utf8 unify as Utf8 at the value level.
pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Categorical, Float64, Int64, Null, Timestamp, Utf8};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Int64, Float64) | (Float64, Int64) => Float64,
        (Utf8, Categorical) | (Categorical, Utf8) => Utf8,
        (Timestamp, Timestamp) => Timestamp,
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

/// Cast a scalar to a target dtype, taking ownership to skip clones on
/// identity casts. This is the single coercion point for filter values and
/// column construction: failure is always a structured error, never a
/// silent default.
pub fn coerce_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if matches!(value, Scalar::Null) {
        return Ok(Scalar::Null);
    }
    if from == target || (target == DType::Categorical && from == DType::Utf8) {
        return Ok(value);
    }

    match target {
        DType::Null => Ok(Scalar::Null),
        DType::Int64 => match &value {
            Scalar::Float64(v) => {
                if !v.is_finite() || *v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                if *v < i64::MIN as f64 || *v > i64::MAX as f64 {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                Ok(Scalar::Int64(*v as i64))
            }
            Scalar::Utf8(v) => v
                .trim()
                .parse::<i64>()
                .map(Scalar::Int64)
                .or_else(|_| {
                    // "3.0" style inputs: go through the lossless float path.
                    let parsed = v.trim().parse::<f64>().map_err(|_| {
                        TypeError::UnparseableValue {
                            value: v.clone(),
                            dtype: target,
                        }
                    })?;
                    coerce_scalar_owned(Scalar::Float64(parsed), DType::Int64)
                }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match &value {
            Scalar::Int64(v) => Ok(Scalar::Float64(*v as f64)),
            Scalar::Utf8(v) => v
                .trim()
                .parse::<f64>()
                .map(Scalar::Float64)
                .map_err(|_| TypeError::UnparseableValue {
                    value: v.clone(),
                    dtype: target,
                }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Utf8 | DType::Categorical => match &value {
            Scalar::Int64(v) => Ok(Scalar::Utf8(v.to_string())),
            Scalar::Float64(v) => Ok(Scalar::Utf8(v.to_string())),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Timestamp => match &value {
            Scalar::Int64(v) => Ok(Scalar::Timestamp(*v)),
            Scalar::Utf8(v) => parse_timestamp(v)
                .map(Scalar::Timestamp)
                .ok_or_else(|| TypeError::UnparseableValue {
                    value: v.clone(),
                    dtype: target,
                }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
    }
}

/// Cast a scalar reference (clones only when conversion is needed).
pub fn coerce_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    coerce_scalar_owned(value.clone(), target)
}

/// Accepted textual timestamp layouts, tried in order.
const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"];

/// Best-effort parse of a textual timestamp into epoch seconds. Bare dates
/// resolve to midnight.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    for format in &TIMESTAMP_FORMATS[..2] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(trimmed, TIMESTAMP_FORMATS[2])
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Parse with an explicit chrono format string (the cleaning pipeline's
/// fixed raw layout).
#[must_use]
pub fn parse_timestamp_with(raw: &str, format: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(raw.trim(), format)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// ISO rendering of epoch seconds; out-of-range values fall back to the raw
/// number so rendering never fails.
#[must_use]
pub fn format_timestamp(epoch_secs: i64) -> String {
    match DateTime::from_timestamp(epoch_secs, 0) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch_secs.to_string(),
    }
}
