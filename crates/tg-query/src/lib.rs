#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tg_columnar::{Column, ComparisonOp};
use tg_store::{Dataset, InferencePolicy, SchemaEntry, Store, StoreError};
use tg_types::{coerce_scalar, format_timestamp, DType, Scalar, TypeError};

/// Rows returned by a filter when the request carries no explicit cap.
pub const DEFAULT_FILTER_LIMIT: usize = 1000;
/// Most-frequent values reported for non-numeric columns.
pub const TOP_K_DEFAULT: usize = 10;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Transport-level classification so the (out of scope) HTTP adapter can map
/// errors to status codes without inspecting variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No dataset could be loaded; terminal until process restart.
    Unavailable,
    /// The request itself is wrong; fix and retry.
    BadRequest,
    /// Unexpected internal computation failure.
    Internal,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("dataset unavailable: {0}")]
    Unavailable(StoreError),
    #[error("unknown column {name:?}")]
    UnknownColumn { name: String },
    #[error("unknown group column {name:?}")]
    UnknownGroupColumn { name: String },
    #[error("unknown operator {op:?}")]
    UnknownOperator { op: String },
    #[error("operator {op:?} is not supported for column {column:?} of type {dtype:?}")]
    UnsupportedOperator {
        op: FilterOp,
        column: String,
        dtype: DType,
    },
    #[error("cannot group by column {name:?} of type {dtype:?}")]
    UnsupportedGroupColumn { name: String, dtype: DType },
    #[error("invalid filter value {value:?} for column {column:?}: {source}")]
    InvalidFilterValue {
        column: String,
        value: String,
        source: TypeError,
    },
    #[error("operator 'between' requires value2")]
    MissingBound,
    #[error("operator {op:?} takes a single value, not a list")]
    ExpectedScalarValue { op: FilterOp },
    #[error("internal query failure: {0}")]
    Internal(String),
}

impl QueryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::BadRequest,
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownColumn { name } => Self::UnknownColumn { name },
            other => Self::Unavailable(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter engine
// ---------------------------------------------------------------------------

/// The closed operator set. Unknown operator strings fail in
/// [`FilterOp::parse`]; they never silently produce an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Between,
    Contains,
}

impl FilterOp {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "eq" => Ok(Self::Eq),
            "gt" => Ok(Self::Gt),
            "lt" => Ok(Self::Lt),
            "gte" => Ok(Self::Gte),
            "lte" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            "between" => Ok(Self::Between),
            "contains" => Ok(Self::Contains),
            other => Err(QueryError::UnknownOperator {
                op: other.to_owned(),
            }),
        }
    }
}

/// A filter value: one scalar, or a sequence for membership tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(Scalar),
    Many(Vec<Scalar>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub column: String,
    #[serde(rename = "operator")]
    pub op: FilterOp,
    pub value: FilterValue,
    #[serde(default)]
    pub value2: Option<Scalar>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Matching row positions in original order, capped by the request limit;
/// `total_matches` always reflects the untruncated match count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    pub positions: Vec<usize>,
    pub total_matches: usize,
}

fn invalid_value(column: &str, value: &Scalar, source: TypeError) -> QueryError {
    QueryError::InvalidFilterValue {
        column: column.to_owned(),
        value: value.display_string(),
        source,
    }
}

fn single_value(spec: &FilterSpec) -> Result<&Scalar, QueryError> {
    match &spec.value {
        FilterValue::One(scalar) => Ok(scalar),
        FilterValue::Many(_) => Err(QueryError::ExpectedScalarValue { op: spec.op }),
    }
}

fn coerce_probe(column_name: &str, column: &Column, value: &Scalar) -> Result<Scalar, QueryError> {
    coerce_scalar(value, column.dtype()).map_err(|source| invalid_value(column_name, value, source))
}

/// Membership probes: an explicit sequence, or a single string interpreted
/// as a comma-delimited list. Each element is coerced to the column dtype.
fn membership_probes(
    column_name: &str,
    column: &Column,
    value: &FilterValue,
) -> Result<Vec<Scalar>, QueryError> {
    let raw: Vec<Scalar> = match value {
        FilterValue::Many(values) => values.clone(),
        FilterValue::One(Scalar::Utf8(joined)) => joined
            .split(',')
            .map(|part| Scalar::Utf8(part.trim().to_owned()))
            .collect(),
        FilterValue::One(single) => vec![single.clone()],
    };

    raw.iter()
        .map(|scalar| coerce_probe(column_name, column, scalar))
        .collect()
}

fn contains_needle(spec: &FilterSpec) -> Result<String, QueryError> {
    let scalar = single_value(spec)?;
    if scalar.is_missing() {
        return Err(invalid_value(&spec.column, scalar, TypeError::ValueIsMissing));
    }
    Ok(scalar.display_string().to_lowercase())
}

/// Evaluate a filter against the dataset. Result rows are a prefix (in
/// original row order) of all matching rows; nulls never match.
pub fn apply_filter(dataset: &Dataset, spec: &FilterSpec) -> Result<FilterResult, QueryError> {
    let column = dataset
        .column(&spec.column)
        .ok_or_else(|| QueryError::UnknownColumn {
            name: spec.column.clone(),
        })?;

    let mask: Vec<bool> = match spec.op {
        FilterOp::Eq | FilterOp::Gt | FilterOp::Lt | FilterOp::Gte | FilterOp::Lte => {
            let probe = coerce_probe(&spec.column, column, single_value(spec)?)?;
            let op = match spec.op {
                FilterOp::Eq => ComparisonOp::Eq,
                FilterOp::Gt => ComparisonOp::Gt,
                FilterOp::Lt => ComparisonOp::Lt,
                FilterOp::Gte => ComparisonOp::Ge,
                FilterOp::Lte => ComparisonOp::Le,
                _ => unreachable!("outer match restricts to comparison operators"),
            };
            column.matches_scalar(&probe, op)
        }
        FilterOp::In => {
            let probes = membership_probes(&spec.column, column, &spec.value)?;
            column.matches_any(&probes)
        }
        FilterOp::Between => {
            let low = coerce_probe(&spec.column, column, single_value(spec)?)?;
            let high_raw = spec.value2.as_ref().ok_or(QueryError::MissingBound)?;
            let high = coerce_probe(&spec.column, column, high_raw)?;
            let ge = column.matches_scalar(&low, ComparisonOp::Ge);
            let le = column.matches_scalar(&high, ComparisonOp::Le);
            ge.into_iter().zip(le).map(|(a, b)| a && b).collect()
        }
        FilterOp::Contains => {
            if !column.dtype().is_textual() {
                return Err(QueryError::UnsupportedOperator {
                    op: spec.op,
                    column: spec.column.clone(),
                    dtype: column.dtype(),
                });
            }
            let needle = contains_needle(spec)?;
            column
                .values()
                .iter()
                .map(|value| match value {
                    Scalar::Utf8(s) => s.to_lowercase().contains(&needle),
                    _ => false,
                })
                .collect()
        }
    };

    let total_matches = mask.iter().filter(|hit| **hit).count();
    let limit = spec.limit.unwrap_or(DEFAULT_FILTER_LIMIT);
    let positions: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(idx, hit)| hit.then_some(idx))
        .take(limit)
        .collect();

    Ok(FilterResult {
        positions,
        total_matches,
    })
}

// ---------------------------------------------------------------------------
// Aggregation engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub columns: Vec<String>,
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub q25: Option<f64>,
    pub q75: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopValue {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoricalSummary {
    pub count: usize,
    pub unique: usize,
    pub top_values: Vec<TopValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnSummary {
    Numeric(NumericSummary),
    Categorical(CategoricalSummary),
    Grouped(BTreeMap<String, GroupSummary>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryReport {
    pub statistics: BTreeMap<String, ColumnSummary>,
    pub columns_analyzed: Vec<String>,
    pub grouped_by: Option<String>,
}

fn non_null_f64s(column: &Column) -> Vec<f64> {
    column
        .values()
        .iter()
        .filter(|v| !v.is_missing())
        .filter_map(|v| v.to_f64().ok())
        .collect()
}

/// Linear interpolation between order statistics, matching
/// `Series.quantile` semantics. Input must be sorted and non-empty.
fn percentile_linear(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

fn numeric_summary(column: &Column) -> NumericSummary {
    let mut values = non_null_f64s(column);
    if values.is_empty() {
        return NumericSummary {
            count: 0,
            mean: None,
            std: None,
            min: None,
            max: None,
            median: None,
            q25: None,
            q75: None,
        };
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    NumericSummary {
        count,
        mean: Some(mean),
        std: sample_std(&values, mean),
        min: Some(values[0]),
        max: Some(values[count - 1]),
        median: Some(percentile_linear(&values, 0.5)),
        q25: Some(percentile_linear(&values, 0.25)),
        q75: Some(percentile_linear(&values, 0.75)),
    }
}

/// Frequency table of non-null values in descending count order. The sort
/// is stable, so tied counts keep first-seen order.
fn value_counts(column: &Column) -> Vec<TopValue> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in column.values() {
        if value.is_missing() {
            continue;
        }
        let key = value.display_string();
        match counts.get_mut(&key) {
            Some(count) => *count += 1,
            None => {
                counts.insert(key.clone(), 1);
                order.push(key);
            }
        }
    }

    let mut out: Vec<TopValue> = order
        .into_iter()
        .map(|value| {
            let count = counts[&value];
            TopValue { value, count }
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count));
    out
}

fn categorical_summary(column: &Column, top_k: usize) -> CategoricalSummary {
    let mut top_values = value_counts(column);
    let unique = top_values.len();
    top_values.truncate(top_k);
    CategoricalSummary {
        count: column.non_null_count(),
        unique,
        top_values,
    }
}

fn groupable(dtype: DType) -> bool {
    matches!(dtype, DType::Int64 | DType::Utf8 | DType::Categorical)
}

/// Row positions per distinct non-null group value, keyed by the value's
/// display string. Only groups actually present appear.
fn build_groups(column: &Column) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, value) in column.values().iter().enumerate() {
        if value.is_missing() {
            continue;
        }
        let key = value.display_string();
        match groups.get_mut(&key) {
            Some(rows) => rows.push(idx),
            None => {
                groups.insert(key.clone(), vec![idx]);
                order.push(key);
            }
        }
    }
    order
        .into_iter()
        .map(|key| {
            let rows = groups.remove(&key).unwrap_or_default();
            (key, rows)
        })
        .collect()
}

fn group_summary(column: &Column, rows: &[usize]) -> GroupSummary {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|&idx| column.value(idx))
        .filter(|v| !v.is_missing())
        .filter_map(|v| v.to_f64().ok())
        .collect();

    if values.is_empty() {
        return GroupSummary {
            count: 0,
            mean: None,
            min: None,
            max: None,
            std: None,
        };
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    GroupSummary {
        count,
        mean: Some(mean),
        min: Some(min),
        max: Some(max),
        std: sample_std(&values, mean),
    }
}

/// Summary statistics per requested column; grouped by a bounded-cardinality
/// key column when `group_by` is present.
pub fn summarize(
    dataset: &Dataset,
    spec: &AggregationSpec,
    top_k: usize,
) -> Result<SummaryReport, QueryError> {
    for name in &spec.columns {
        if dataset.column(name).is_none() {
            return Err(QueryError::UnknownColumn { name: name.clone() });
        }
    }

    let mut statistics: BTreeMap<String, ColumnSummary> = BTreeMap::new();

    if let Some(group_name) = &spec.group_by {
        let group_column =
            dataset
                .column(group_name)
                .ok_or_else(|| QueryError::UnknownGroupColumn {
                    name: group_name.clone(),
                })?;
        if !groupable(group_column.dtype()) {
            return Err(QueryError::UnsupportedGroupColumn {
                name: group_name.clone(),
                dtype: group_column.dtype(),
            });
        }

        let groups = build_groups(group_column);
        for name in &spec.columns {
            let column = dataset
                .column(name)
                .ok_or_else(|| QueryError::UnknownColumn { name: name.clone() })?;
            if !column.dtype().is_numeric() {
                continue;
            }
            let per_group: BTreeMap<String, GroupSummary> = groups
                .iter()
                .map(|(key, rows)| (key.clone(), group_summary(column, rows)))
                .collect();
            statistics.insert(name.clone(), ColumnSummary::Grouped(per_group));
        }
    } else {
        for name in &spec.columns {
            let column = dataset
                .column(name)
                .ok_or_else(|| QueryError::UnknownColumn { name: name.clone() })?;
            let summary = if column.dtype().is_numeric() {
                ColumnSummary::Numeric(numeric_summary(column))
            } else {
                ColumnSummary::Categorical(categorical_summary(column, top_k))
            };
            statistics.insert(name.clone(), summary);
        }
    }

    Ok(SummaryReport {
        statistics,
        columns_analyzed: spec.columns.clone(),
        grouped_by: spec.group_by.clone(),
    })
}

// ---------------------------------------------------------------------------
// Query facade
// ---------------------------------------------------------------------------

fn scalar_to_json(value: &Scalar) -> serde_json::Value {
    match value {
        Scalar::Null => serde_json::Value::Null,
        Scalar::Int64(v) => serde_json::Value::from(*v),
        Scalar::Float64(v) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Scalar::Utf8(v) => serde_json::Value::from(v.clone()),
        Scalar::Timestamp(v) => serde_json::Value::from(format_timestamp(*v)),
    }
}

pub type RowObject = BTreeMap<String, serde_json::Value>;

fn gather_rows(dataset: &Dataset, positions: &[usize]) -> Vec<RowObject> {
    positions
        .iter()
        .map(|&idx| {
            dataset
                .columns()
                .map(|(name, column)| {
                    let value = column.value(idx).map_or(serde_json::Value::Null, scalar_to_json);
                    (name.to_owned(), value)
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewResponse {
    pub data: Vec<RowObject>,
    pub total_records: usize,
    pub preview_count: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub dtype: DType,
    pub non_null_count: usize,
    pub null_count: usize,
    pub distinct_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnsResponse {
    pub columns: Vec<ColumnInfo>,
    pub total_columns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterResponse {
    pub data: Vec<RowObject>,
    pub total_matches: usize,
    pub returned_count: usize,
    pub total_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryResponse {
    pub total_rows: usize,
    pub total_columns: usize,
    pub column_types: BTreeMap<String, usize>,
    pub missing_data: BTreeMap<String, usize>,
    pub date_range: BTreeMap<String, TimestampRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniqueValuesResponse {
    pub column: String,
    pub unique_values: Vec<TopValue>,
    pub total_unique: usize,
    pub showing: usize,
}

fn dtype_label(dtype: DType) -> &'static str {
    match dtype {
        DType::Null => "null",
        DType::Int64 => "int64",
        DType::Float64 => "float64",
        DType::Utf8 => "utf8",
        DType::Categorical => "categorical",
        DType::Timestamp => "timestamp",
    }
}

/// Composes the store, the filter engine and the aggregation engine behind
/// the operations the transport adapter calls. Loads lazily on first use.
pub struct QueryFacade {
    store: Arc<Store>,
    candidates: Vec<PathBuf>,
    policy: InferencePolicy,
    top_k: usize,
}

impl QueryFacade {
    #[must_use]
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self {
            store: Arc::new(Store::new()),
            candidates,
            policy: InferencePolicy::default(),
            top_k: TOP_K_DEFAULT,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: InferencePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn dataset(&self) -> Result<&Dataset, QueryError> {
        self.store
            .get_or_load(&self.candidates, &self.policy)
            .map_err(QueryError::from)
    }

    pub fn preview(&self, limit: usize) -> Result<PreviewResponse, QueryError> {
        let dataset = self.dataset()?;
        let positions: Vec<usize> = (0..dataset.len().min(limit)).collect();
        let data = gather_rows(dataset, &positions);
        Ok(PreviewResponse {
            preview_count: data.len(),
            total_records: dataset.len(),
            columns: dataset.names().to_vec(),
            data,
        })
    }

    pub fn schema(&self) -> Result<Vec<SchemaEntry>, QueryError> {
        Ok(self.dataset()?.schema())
    }

    pub fn columns(&self) -> Result<ColumnsResponse, QueryError> {
        let dataset = self.dataset()?;
        let mut columns = Vec::with_capacity(dataset.width());
        for name in dataset.names() {
            let stats = self.store.stats(dataset, name)?;
            let numeric = stats.dtype.is_numeric();
            let temporal = stats.dtype == DType::Timestamp;
            let bound_f64 = |bound: &Option<Scalar>| {
                bound.as_ref().and_then(|scalar| scalar.to_f64().ok())
            };
            let bound_ts = |bound: &Option<Scalar>| match bound {
                Some(Scalar::Timestamp(v)) => Some(format_timestamp(*v)),
                _ => None,
            };
            columns.push(ColumnInfo {
                name: name.clone(),
                dtype: stats.dtype,
                non_null_count: stats.non_null_count,
                null_count: stats.null_count,
                distinct_count: stats.distinct_count,
                min: numeric.then(|| bound_f64(&stats.min)).flatten(),
                max: numeric.then(|| bound_f64(&stats.max)).flatten(),
                mean: if numeric { stats.mean } else { None },
                min_timestamp: temporal.then(|| bound_ts(&stats.min)).flatten(),
                max_timestamp: temporal.then(|| bound_ts(&stats.max)).flatten(),
            });
        }
        Ok(ColumnsResponse {
            total_columns: columns.len(),
            columns,
        })
    }

    pub fn filter(&self, spec: &FilterSpec) -> Result<FilterResponse, QueryError> {
        let dataset = self.dataset()?;
        let result = apply_filter(dataset, spec)?;
        let data = gather_rows(dataset, &result.positions);
        Ok(FilterResponse {
            returned_count: data.len(),
            total_matches: result.total_matches,
            total_records: dataset.len(),
            data,
        })
    }

    pub fn stats(&self, spec: &AggregationSpec) -> Result<SummaryReport, QueryError> {
        let dataset = self.dataset()?;
        summarize(dataset, spec, self.top_k)
    }

    pub fn summary(&self) -> Result<SummaryResponse, QueryError> {
        let dataset = self.dataset()?;
        let mut column_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut missing_data: BTreeMap<String, usize> = BTreeMap::new();
        let mut date_range: BTreeMap<String, TimestampRange> = BTreeMap::new();

        for name in dataset.names() {
            let stats = self.store.stats(dataset, name)?;
            *column_types.entry(dtype_label(stats.dtype).to_owned()).or_insert(0) += 1;
            if stats.null_count > 0 {
                missing_data.insert(name.clone(), stats.null_count);
            }
            if stats.dtype == DType::Timestamp {
                if let (Some(Scalar::Timestamp(start)), Some(Scalar::Timestamp(end))) =
                    (&stats.min, &stats.max)
                {
                    date_range.insert(
                        name.clone(),
                        TimestampRange {
                            start: format_timestamp(*start),
                            end: format_timestamp(*end),
                        },
                    );
                }
            }
        }

        Ok(SummaryResponse {
            total_rows: dataset.len(),
            total_columns: dataset.width(),
            column_types,
            missing_data,
            date_range,
        })
    }

    pub fn unique_values(
        &self,
        column: &str,
        limit: usize,
    ) -> Result<UniqueValuesResponse, QueryError> {
        let dataset = self.dataset()?;
        let col = dataset
            .column(column)
            .ok_or_else(|| QueryError::UnknownColumn {
                name: column.to_owned(),
            })?;
        let mut unique_values = value_counts(col);
        let total_unique = unique_values.len();
        unique_values.truncate(limit);
        Ok(UniqueValuesResponse {
            column: column.to_owned(),
            showing: unique_values.len(),
            total_unique,
            unique_values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        apply_filter, summarize, AggregationSpec, ColumnSummary, FilterOp, FilterSpec,
        FilterValue, QueryError, TOP_K_DEFAULT,
    };
    use tg_columnar::Column;
    use tg_store::Dataset;
    use tg_types::{DType, Scalar};

    fn trips() -> Dataset {
        let fare = Column::new(
            DType::Float64,
            vec![
                Scalar::Float64(10.0),
                Scalar::Float64(20.0),
                Scalar::Null,
                Scalar::Float64(12.5),
                Scalar::Float64(20.0),
            ],
        )
        .expect("fare");
        let vendor = Column::new(
            DType::Int64,
            vec![
                Scalar::Int64(1),
                Scalar::Int64(2),
                Scalar::Int64(1),
                Scalar::Int64(2),
                Scalar::Null,
            ],
        )
        .expect("vendor");
        let flag = Column::new(
            DType::Categorical,
            vec![
                Scalar::Utf8("N".into()),
                Scalar::Utf8("Y".into()),
                Scalar::Utf8("N".into()),
                Scalar::Null,
                Scalar::Utf8("N".into()),
            ],
        )
        .expect("flag");
        Dataset::from_columns(vec![
            ("fare".into(), fare),
            ("vendor".into(), vendor),
            ("flag".into(), flag),
        ])
        .expect("dataset")
    }

    fn spec(column: &str, op: FilterOp, value: Scalar) -> FilterSpec {
        FilterSpec {
            column: column.into(),
            op,
            value: FilterValue::One(value),
            value2: None,
            limit: None,
        }
    }

    #[test]
    fn eq_coerces_string_values_to_column_dtype() {
        let dataset = trips();
        let result =
            apply_filter(&dataset, &spec("vendor", FilterOp::Eq, Scalar::Utf8("2".into())))
                .expect("filter");
        assert_eq!(result.positions, vec![1, 3]);
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn coercion_failure_names_column_and_value() {
        let dataset = trips();
        let err =
            apply_filter(&dataset, &spec("fare", FilterOp::Gt, Scalar::Utf8("cheap".into())))
                .expect_err("must fail");
        match err {
            QueryError::InvalidFilterValue { column, value, .. } => {
                assert_eq!(column, "fare");
                assert_eq!(value, "cheap");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_column_is_rejected_not_empty() {
        let dataset = trips();
        let err = apply_filter(&dataset, &spec("absent", FilterOp::Eq, Scalar::Int64(1)))
            .expect_err("must fail");
        assert!(matches!(err, QueryError::UnknownColumn { .. }));
    }

    #[test]
    fn in_accepts_comma_delimited_string() {
        let dataset = trips();
        let listed = spec("vendor", FilterOp::In, Scalar::Utf8("1, 2".into()));
        let result = apply_filter(&dataset, &listed).expect("filter");
        assert_eq!(result.positions, vec![0, 1, 2, 3]);

        let explicit = FilterSpec {
            value: FilterValue::Many(vec![Scalar::Int64(2), Scalar::Int64(1)]),
            ..listed
        };
        let reordered = apply_filter(&dataset, &explicit).expect("filter");
        assert_eq!(reordered.positions, result.positions);
    }

    #[test]
    fn between_requires_second_bound() {
        let dataset = trips();
        let mut missing = spec("fare", FilterOp::Between, Scalar::Float64(10.0));
        let err = apply_filter(&dataset, &missing).expect_err("must fail");
        assert!(matches!(err, QueryError::MissingBound));

        missing.value2 = Some(Scalar::Float64(15.0));
        let result = apply_filter(&dataset, &missing).expect("filter");
        assert_eq!(result.positions, vec![0, 3]);
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        let dataset = trips();
        let mut bounds = spec("fare", FilterOp::Between, Scalar::Float64(10.0));
        bounds.value2 = Some(Scalar::Float64(20.0));
        let result = apply_filter(&dataset, &bounds).expect("filter");
        assert_eq!(result.positions, vec![0, 1, 3, 4]);
    }

    #[test]
    fn contains_matches_case_insensitively_and_skips_nulls() {
        let dataset = trips();
        let result = apply_filter(&dataset, &spec("flag", FilterOp::Contains, Scalar::Utf8("n".into())))
            .expect("filter");
        assert_eq!(result.positions, vec![0, 2, 4]);
    }

    #[test]
    fn contains_on_numeric_column_is_unsupported() {
        let dataset = trips();
        let err = apply_filter(&dataset, &spec("fare", FilterOp::Contains, Scalar::Utf8("1".into())))
            .expect_err("must fail");
        assert!(matches!(err, QueryError::UnsupportedOperator { .. }));
    }

    #[test]
    fn limit_caps_rows_but_not_total_matches() {
        let dataset = trips();
        let mut capped = spec("fare", FilterOp::Gte, Scalar::Float64(10.0));
        capped.limit = Some(2);
        let result = apply_filter(&dataset, &capped).expect("filter");
        assert_eq!(result.positions, vec![0, 1]);
        assert_eq!(result.total_matches, 4);
    }

    #[test]
    fn operator_parse_rejects_unknown_names() {
        assert!(FilterOp::parse("between").is_ok());
        assert!(matches!(
            FilterOp::parse("regex"),
            Err(QueryError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn numeric_summary_matches_hand_computed_values() {
        let dataset = trips();
        let report = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["fare".into()],
                group_by: None,
            },
            TOP_K_DEFAULT,
        )
        .expect("summarize");

        let ColumnSummary::Numeric(summary) = &report.statistics["fare"] else {
            panic!("expected numeric summary");
        };
        assert_eq!(summary.count, 4);
        let mean = summary.mean.expect("mean");
        assert!((mean - 15.625).abs() < 1e-9);
        assert_eq!(summary.min, Some(10.0));
        assert_eq!(summary.max, Some(20.0));
        // sorted: 10, 12.5, 20, 20 -> median halfway between 12.5 and 20.
        assert_eq!(summary.median, Some(16.25));
    }

    #[test]
    fn all_null_numeric_summary_is_zeroed() {
        let nulls = Column::new(DType::Float64, vec![Scalar::Null, Scalar::Null]).expect("col");
        let dataset = Dataset::from_columns(vec![("empty".into(), nulls)]).expect("dataset");
        let report = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["empty".into()],
                group_by: None,
            },
            TOP_K_DEFAULT,
        )
        .expect("summarize");

        let ColumnSummary::Numeric(summary) = &report.statistics["empty"] else {
            panic!("expected numeric summary");
        };
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean, None);
        assert_eq!(summary.std, None);
    }

    #[test]
    fn categorical_summary_ranks_by_frequency_with_stable_ties() {
        let dataset = trips();
        let report = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["flag".into()],
                group_by: None,
            },
            TOP_K_DEFAULT,
        )
        .expect("summarize");

        let ColumnSummary::Categorical(summary) = &report.statistics["flag"] else {
            panic!("expected categorical summary");
        };
        assert_eq!(summary.count, 4);
        assert_eq!(summary.unique, 2);
        assert_eq!(summary.top_values[0].value, "N");
        assert_eq!(summary.top_values[0].count, 3);
    }

    #[test]
    fn grouped_keys_are_exactly_present_non_null_values() {
        let dataset = trips();
        let report = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["fare".into()],
                group_by: Some("vendor".into()),
            },
            TOP_K_DEFAULT,
        )
        .expect("summarize");

        let ColumnSummary::Grouped(groups) = &report.statistics["fare"] else {
            panic!("expected grouped summary");
        };
        let keys: Vec<&str> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["1", "2"]);

        let one = &groups["1"];
        assert_eq!(one.count, 1); // vendor 1 has fares 10.0 and null
        assert_eq!(one.mean, Some(10.0));
        let two = &groups["2"];
        assert_eq!(two.count, 2);
        assert_eq!(two.mean, Some(16.25));
        assert_eq!(two.min, Some(12.5));
        assert_eq!(two.max, Some(20.0));
    }

    #[test]
    fn grouping_by_unknown_or_float_column_is_rejected() {
        let dataset = trips();
        let missing = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["fare".into()],
                group_by: Some("zone".into()),
            },
            TOP_K_DEFAULT,
        );
        assert!(matches!(
            missing,
            Err(QueryError::UnknownGroupColumn { .. })
        ));

        let unbounded = summarize(
            &dataset,
            &AggregationSpec {
                columns: vec!["vendor".into()],
                group_by: Some("fare".into()),
            },
            TOP_K_DEFAULT,
        );
        assert!(matches!(
            unbounded,
            Err(QueryError::UnsupportedGroupColumn { .. })
        ));
    }

    #[test]
    fn error_kinds_map_to_transport_classes() {
        use super::ErrorKind;
        let bad = QueryError::MissingBound;
        assert_eq!(bad.kind(), ErrorKind::BadRequest);
        let unavailable = QueryError::Unavailable(tg_store::StoreError::DataUnavailable {
            tried: vec![],
        });
        assert_eq!(unavailable.kind(), ErrorKind::Unavailable);
        let internal = QueryError::Internal("boom".into());
        assert_eq!(internal.kind(), ErrorKind::Internal);
    }
}
