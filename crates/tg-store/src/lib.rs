#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use tg_columnar::{Column, ColumnError, ColumnStats};
use tg_types::{parse_timestamp, DType, Scalar};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no readable dataset among candidate locations: {tried:?}")]
    DataUnavailable { tried: Vec<PathBuf> },
    #[error("columns have mismatched lengths: {left_name}={left} vs {right_name}={right}")]
    RaggedColumns {
        left_name: String,
        left: usize,
        right_name: String,
        right: usize,
    },
    #[error("unknown column {name:?}")]
    UnknownColumn { name: String },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// One entry of the loaded dataset's schema, in stable column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaEntry {
    pub name: String,
    pub dtype: DType,
    pub nullable: bool,
}

/// The loaded dataset: ordered named columns sharing one row count.
/// Read-only after load; query engines borrow it, never mutate it.
#[derive(Debug, Clone)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<Column>,
    row_count: usize,
}

impl Dataset {
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self, StoreError> {
        let mut names: Vec<String> = Vec::with_capacity(columns.len());
        let mut cols = Vec::with_capacity(columns.len());
        let mut row_count = 0_usize;

        for (idx, (name, column)) in columns.into_iter().enumerate() {
            if idx == 0 {
                row_count = column.len();
            } else if column.len() != row_count {
                return Err(StoreError::RaggedColumns {
                    left_name: names[0].clone(),
                    left: row_count,
                    right_name: name,
                    right: column.len(),
                });
            }
            names.push(name);
            cols.push(column);
        }

        Ok(Self {
            names,
            columns: cols,
            row_count,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter())
    }

    #[must_use]
    pub fn schema(&self) -> Vec<SchemaEntry> {
        self.columns()
            .map(|(name, column)| SchemaEntry {
                name: name.to_owned(),
                dtype: column.dtype(),
                nullable: column.null_count() > 0,
            })
            .collect()
    }
}

/// The load-time re-typing heuristic, carried as configurable defaults.
/// It is lossy and non-reversible: a column promoted to timestamp or
/// tagged categorical keeps that shape for the process lifetime.
#[derive(Debug, Clone)]
pub struct InferencePolicy {
    /// Utf8 columns whose distinct/row ratio falls below this are tagged
    /// categorical.
    pub categorical_max_ratio: f64,
    /// Name fragments that mark a column as temporal.
    pub temporal_name_hints: Vec<String>,
}

impl Default for InferencePolicy {
    fn default() -> Self {
        Self {
            categorical_max_ratio: 0.5,
            temporal_name_hints: ["datetime", "timestamp", "_ts", "date", "time"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

impl InferencePolicy {
    #[must_use]
    fn is_temporal_name(&self, name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        self.temporal_name_hints
            .iter()
            .any(|hint| lowered.contains(hint))
    }
}

/// Try to promote a Utf8 column to Timestamp. All-or-nothing: if any
/// non-null value fails to parse, the original column is returned
/// untouched and the decision is logged rather than swallowed.
fn promote_to_timestamp(name: &str, column: Column) -> Result<Column, ColumnError> {
    let mut parsed: Vec<Scalar> = Vec::with_capacity(column.len());
    let mut unparseable: Option<String> = None;
    for value in column.values() {
        match value {
            Scalar::Null => parsed.push(Scalar::Null),
            Scalar::Utf8(raw) => match parse_timestamp(raw) {
                Some(epoch) => parsed.push(Scalar::Timestamp(epoch)),
                None => {
                    unparseable = Some(raw.clone());
                    break;
                }
            },
            other => {
                unparseable = Some(other.display_string());
                break;
            }
        }
    }

    if let Some(value) = unparseable {
        debug!(
            column = name,
            value = value.as_str(),
            "temporal hint did not parse; leaving column as utf8"
        );
        return Ok(column);
    }
    Column::new(DType::Timestamp, parsed)
}

/// Load-time re-typing of generic string columns: temporal names parse to
/// timestamps (best effort), low-cardinality strings get the categorical
/// tag. Runs once per load.
fn infer_column_types(
    columns: Vec<(String, Column)>,
    policy: &InferencePolicy,
) -> Result<Vec<(String, Column)>, StoreError> {
    let mut out = Vec::with_capacity(columns.len());
    for (name, column) in columns {
        if column.dtype() != DType::Utf8 {
            out.push((name, column));
            continue;
        }

        if policy.is_temporal_name(&name) {
            let promoted = promote_to_timestamp(&name, column)?;
            if promoted.dtype() == DType::Timestamp {
                debug!(column = name.as_str(), "promoted utf8 column to timestamp");
            }
            out.push((name, promoted));
            continue;
        }

        let rows = column.len();
        if rows > 0 {
            let distinct = ColumnStats::compute(&column).distinct_count;
            let ratio = distinct as f64 / rows as f64;
            if ratio < policy.categorical_max_ratio {
                debug!(
                    column = name.as_str(),
                    distinct, rows, "tagged low-cardinality utf8 column as categorical"
                );
                out.push((name, column.retag(DType::Categorical)?));
                continue;
            }
        }
        out.push((name, column));
    }
    Ok(out)
}

fn read_candidate(path: &Path) -> Result<Vec<(String, Column)>, tg_io::IoError> {
    if path.is_dir() {
        tg_io::read_parquet_dir(path)
    } else {
        tg_io::read_parquet_file(path)
    }
}

/// Try each candidate location in order; read failures are logged and the
/// next candidate tried. Only exhaustion is a hard failure.
pub fn load(candidates: &[PathBuf], policy: &InferencePolicy) -> Result<Dataset, StoreError> {
    for candidate in candidates {
        match read_candidate(candidate) {
            Ok(columns) => {
                let typed = infer_column_types(columns, policy)?;
                let dataset = Dataset::from_columns(typed)?;
                info!(
                    path = %candidate.display(),
                    rows = dataset.len(),
                    columns = dataset.width(),
                    "dataset loaded"
                );
                return Ok(dataset);
            }
            Err(error) => {
                warn!(
                    path = %candidate.display(),
                    %error,
                    "candidate location unreadable, trying next"
                );
            }
        }
    }
    Err(StoreError::DataUnavailable {
        tried: candidates.to_vec(),
    })
}

/// Process-wide dataset handle. The load runs at most once (single-flight
/// via `OnceCell`); per-column stats are memoized under a mutex. There is
/// no invalidation: a reload requires a new `Store`.
#[derive(Debug, Default)]
pub struct Store {
    dataset: OnceCell<Dataset>,
    stats: Mutex<HashMap<String, Arc<ColumnStats>>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &self,
        candidates: &[PathBuf],
        policy: &InferencePolicy,
    ) -> Result<&Dataset, StoreError> {
        self.dataset.get_or_try_init(|| load(candidates, policy))
    }

    /// Memoized per-column statistics. First access computes; later
    /// accesses share the cached value.
    pub fn stats(&self, dataset: &Dataset, column: &str) -> Result<Arc<ColumnStats>, StoreError> {
        if let Some(cached) = self.stats.lock().get(column) {
            return Ok(Arc::clone(cached));
        }

        let col = dataset.column(column).ok_or_else(|| StoreError::UnknownColumn {
            name: column.to_owned(),
        })?;
        let computed = Arc::new(ColumnStats::compute(col));
        self.stats
            .lock()
            .insert(column.to_owned(), Arc::clone(&computed));
        Ok(computed)
    }
}
