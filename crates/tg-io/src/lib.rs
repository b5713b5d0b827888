#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array, LargeStringArray,
    StringArray, TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::de::DeserializeOwned;
use thiserror::Error;

use tg_columnar::{Column, ColumnError};
use tg_types::{DType, Scalar};

const READ_BATCH_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error("no parquet fragments found in {path}")]
    NoFragments { path: String },
    #[error("fragment {path} is missing column {column:?} present in the first fragment")]
    FragmentSchemaMismatch { path: String, column: String },
    #[error("column {column:?} has unsupported arrow type {datatype}")]
    UnsupportedArrowType { column: String, datatype: String },
}

fn dtype_for_arrow(column: &str, datatype: &DataType) -> Result<DType, IoError> {
    match datatype {
        DataType::Int32 | DataType::Int64 => Ok(DType::Int64),
        DataType::Float32 | DataType::Float64 => Ok(DType::Float64),
        DataType::Utf8 | DataType::LargeUtf8 => Ok(DType::Utf8),
        DataType::Timestamp(_, _) => Ok(DType::Timestamp),
        other => Err(IoError::UnsupportedArrowType {
            column: column.to_owned(),
            datatype: other.to_string(),
        }),
    }
}

macro_rules! collect_primitive {
    ($array:expr, $arr_ty:ty, $variant:expr, $out:expr) => {{
        let typed = $array
            .as_any()
            .downcast_ref::<$arr_ty>()
            .expect("arrow type checked against DataType");
        for idx in 0..typed.len() {
            if typed.is_null(idx) {
                $out.push(Scalar::Null);
            } else {
                $out.push($variant(typed.value(idx)));
            }
        }
    }};
}

fn append_arrow_values(
    column: &str,
    array: &ArrayRef,
    out: &mut Vec<Scalar>,
) -> Result<(), IoError> {
    match array.data_type() {
        DataType::Int64 => collect_primitive!(array, Int64Array, Scalar::Int64, out),
        DataType::Int32 => {
            collect_primitive!(array, Int32Array, |v: i32| Scalar::Int64(i64::from(v)), out)
        }
        DataType::Float64 => collect_primitive!(array, Float64Array, Scalar::Float64, out),
        DataType::Float32 => collect_primitive!(
            array,
            Float32Array,
            |v: f32| Scalar::Float64(f64::from(v)),
            out
        ),
        DataType::Utf8 => collect_primitive!(
            array,
            StringArray,
            |v: &str| Scalar::Utf8(v.to_owned()),
            out
        ),
        DataType::LargeUtf8 => collect_primitive!(
            array,
            LargeStringArray,
            |v: &str| Scalar::Utf8(v.to_owned()),
            out
        ),
        DataType::Timestamp(unit, _) => match unit {
            TimeUnit::Second => {
                collect_primitive!(array, TimestampSecondArray, Scalar::Timestamp, out)
            }
            TimeUnit::Millisecond => collect_primitive!(
                array,
                TimestampMillisecondArray,
                |v: i64| Scalar::Timestamp(v / 1_000),
                out
            ),
            TimeUnit::Microsecond => collect_primitive!(
                array,
                TimestampMicrosecondArray,
                |v: i64| Scalar::Timestamp(v / 1_000_000),
                out
            ),
            TimeUnit::Nanosecond => collect_primitive!(
                array,
                TimestampNanosecondArray,
                |v: i64| Scalar::Timestamp(v / 1_000_000_000),
                out
            ),
        },
        other => {
            return Err(IoError::UnsupportedArrowType {
                column: column.to_owned(),
                datatype: other.to_string(),
            })
        }
    }
    Ok(())
}

/// Read one parquet file into ordered (name, column) pairs. Column order is
/// the file's schema order.
pub fn read_parquet_file(path: &Path) -> Result<Vec<(String, Column)>, IoError> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(READ_BATCH_SIZE)
        .build()?;

    let schema = reader.schema();
    let mut names: Vec<String> = Vec::with_capacity(schema.fields().len());
    let mut dtypes: Vec<DType> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        names.push(field.name().clone());
        dtypes.push(dtype_for_arrow(field.name(), field.data_type())?);
    }

    let mut buffers: Vec<Vec<Scalar>> = vec![Vec::new(); names.len()];
    for batch in reader {
        let batch = batch?;
        for (idx, name) in names.iter().enumerate() {
            append_arrow_values(name, batch.column(idx), &mut buffers[idx])?;
        }
    }

    names
        .into_iter()
        .zip(dtypes)
        .zip(buffers)
        .map(|((name, dtype), values)| {
            let column = Column::new(dtype, values)?;
            Ok((name, column))
        })
        .collect()
}

/// Read every `*.parquet` fragment in a directory and logically concatenate
/// them. The first fragment (lexicographic filename order, for determinism)
/// governs column order; later fragments must carry the same column names.
pub fn read_parquet_dir(path: &Path) -> Result<Vec<(String, Column)>, IoError> {
    let mut fragments: Vec<_> = fs::read_dir(path)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("parquet"))
        .collect();
    fragments.sort();

    if fragments.is_empty() {
        return Err(IoError::NoFragments {
            path: path.display().to_string(),
        });
    }

    let first = read_parquet_file(&fragments[0])?;
    let names: Vec<String> = first.iter().map(|(name, _)| name.clone()).collect();
    let mut parts: Vec<Vec<Column>> = first
        .into_iter()
        .map(|(_, column)| vec![column])
        .collect();

    for fragment in &fragments[1..] {
        let mut loaded = read_parquet_file(fragment)?;
        for (idx, name) in names.iter().enumerate() {
            let position = loaded
                .iter()
                .position(|(candidate, _)| candidate == name)
                .ok_or_else(|| IoError::FragmentSchemaMismatch {
                    path: fragment.display().to_string(),
                    column: name.clone(),
                })?;
            parts[idx].push(loaded.swap_remove(position).1);
        }
    }

    names
        .into_iter()
        .zip(parts)
        .map(|(name, columns)| Ok((name, Column::concat(&columns)?)))
        .collect()
}

fn arrow_field(name: &str, dtype: DType) -> Field {
    let datatype = match dtype {
        DType::Int64 => DataType::Int64,
        // All-null columns have no better representation than nullable floats.
        DType::Float64 | DType::Null => DataType::Float64,
        DType::Utf8 | DType::Categorical => DataType::Utf8,
        DType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
    };
    Field::new(name, datatype, true)
}

fn arrow_array(column: &Column) -> ArrayRef {
    match column.dtype() {
        DType::Int64 => {
            let values: Vec<Option<i64>> = column
                .values()
                .iter()
                .map(|v| match v {
                    Scalar::Int64(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Arc::new(Int64Array::from(values))
        }
        DType::Float64 | DType::Null => {
            let values: Vec<Option<f64>> = column
                .values()
                .iter()
                .map(|v| match v {
                    Scalar::Float64(f) if !f.is_nan() => Some(*f),
                    Scalar::Int64(i) => Some(*i as f64),
                    _ => None,
                })
                .collect();
            Arc::new(Float64Array::from(values))
        }
        DType::Utf8 | DType::Categorical => {
            let values: Vec<Option<&str>> = column
                .values()
                .iter()
                .map(|v| match v {
                    Scalar::Utf8(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
        DType::Timestamp => {
            let values: Vec<Option<i64>> = column
                .values()
                .iter()
                .map(|v| match v {
                    Scalar::Timestamp(t) => Some(*t * 1_000_000),
                    _ => None,
                })
                .collect();
            Arc::new(TimestampMicrosecondArray::from(values))
        }
    }
}

/// Write ordered columns as a single snappy-compressed parquet file.
pub fn write_parquet(path: &Path, columns: &[(String, Column)]) -> Result<(), IoError> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, column)| arrow_field(name, column.dtype()))
        .collect();
    let schema = Arc::new(ArrowSchema::new(fields));
    let arrays: Vec<ArrayRef> = columns.iter().map(|(_, column)| arrow_array(column)).collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Decode one CSV partition of raw records. Headers are required; empty
/// fields decode as `None` through serde.
pub fn read_csv_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, IoError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    reader
        .deserialize()
        .map(|row| row.map_err(IoError::from))
        .collect()
}
