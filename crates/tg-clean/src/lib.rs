#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use tg_columnar::{Column, ColumnError};
use tg_io::IoError;
use tg_types::{parse_timestamp_with, DType, Scalar};

/// Raw trip timestamps carry this fixed layout, e.g. `03/14/2018 07:25:00 PM`.
pub const TRIP_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no csv partitions found in {path}")]
    NoPartitions { path: PathBuf },
    #[error("failed to list partitions in {path}: {source}")]
    ListPartitions {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed reading partition {path}: {source}")]
    ReadPartition { path: PathBuf, source: IoError },
    #[error("failed writing output {path}: {source}")]
    WriteOutput { path: PathBuf, source: IoError },
    #[error("failed committing {tmp} to {path}: {source}")]
    Commit {
        tmp: PathBuf,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// One raw record as it appears in the source CSV partitions. Every field is
/// optional; missing values are handled by the validity stage, never by the
/// decoder.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrip {
    #[serde(rename = "VendorID")]
    pub vendor_id: Option<i64>,
    pub tpep_pickup_datetime: Option<String>,
    pub tpep_dropoff_datetime: Option<String>,
    pub passenger_count: Option<i64>,
    pub trip_distance: Option<f64>,
    #[serde(rename = "RatecodeID")]
    pub rate_code_id: Option<i64>,
    pub store_and_fwd_flag: Option<String>,
    #[serde(rename = "PULocationID")]
    pub pu_location_id: Option<i64>,
    #[serde(rename = "DOLocationID")]
    pub do_location_id: Option<i64>,
    pub payment_type: Option<i64>,
    pub fare_amount: Option<f64>,
    pub extra: Option<f64>,
    pub mta_tax: Option<f64>,
    pub tip_amount: Option<f64>,
    pub tolls_amount: Option<f64>,
    pub improvement_surcharge: Option<f64>,
    pub total_amount: Option<f64>,
}

/// Cleaning thresholds. Defaults mirror the published trip-record bounds;
/// only the target year is expected to vary between runs.
#[derive(Debug, Clone)]
pub struct CleanConfig {
    pub target_year: i32,
    pub min_passengers: i64,
    pub max_passengers: i64,
    pub max_distance_miles: f64,
    pub max_fare: f64,
    pub max_total: f64,
    pub min_duration_minutes: f64,
    pub max_duration_minutes: f64,
    pub max_speed_mph: f64,
    pub max_tip_percentage: f64,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            target_year: 2018,
            min_passengers: 1,
            max_passengers: 8,
            max_distance_miles: 500.0,
            max_fare: 1000.0,
            max_total: 1000.0,
            min_duration_minutes: 1.0,
            max_duration_minutes: 480.0,
            max_speed_mph: 80.0,
            max_tip_percentage: 50.0,
        }
    }
}

/// A trip that survived every filter stage, with parsed timestamps and the
/// derived columns attached.
#[derive(Debug, Clone)]
pub struct CleanTrip {
    pub raw: RawTrip,
    pub pickup: i64,
    pub dropoff: i64,
    pub trip_duration_minutes: f64,
    pub pickup_hour: i64,
    pub pickup_day_of_week: i64,
    pub pickup_month: i64,
    pub speed_mph: f64,
    pub tip_percentage: f64,
}

/// Row counts after each stage, summed across partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub read: usize,
    pub after_validity: usize,
    pub after_date: usize,
    pub after_range: usize,
}

impl StageCounts {
    fn add(&mut self, other: Self) {
        self.read += other.read;
        self.after_validity += other.after_validity;
        self.after_date += other.after_date;
        self.after_range += other.after_range;
    }
}

#[derive(Debug, Clone)]
pub struct CleanReport {
    pub partitions: usize,
    pub counts: StageCounts,
    pub output: PathBuf,
}

fn in_range(value: Option<f64>, min_exclusive: f64, max_exclusive: f64) -> bool {
    matches!(value, Some(v) if v > min_exclusive && v < max_exclusive)
}

/// Cheap structural rejects, applied before any timestamp parsing: required
/// fields present and inside the published bounds.
#[must_use]
pub fn validity_ok(trip: &RawTrip, config: &CleanConfig) -> bool {
    let has_timestamps =
        trip.tpep_pickup_datetime.is_some() && trip.tpep_dropoff_datetime.is_some();
    let passengers_ok = matches!(
        trip.passenger_count,
        Some(n) if n >= config.min_passengers && n <= config.max_passengers
    );
    let codes_ok = matches!(trip.rate_code_id, Some(c) if (1..=6).contains(&c))
        && matches!(trip.payment_type, Some(p) if (1..=6).contains(&p));

    has_timestamps
        && passengers_ok
        && codes_ok
        && in_range(trip.trip_distance, 0.0, config.max_distance_miles)
        && in_range(trip.fare_amount, 0.0, config.max_fare)
        && in_range(trip.total_amount, 0.0, config.max_total)
        && matches!(trip.tip_amount, Some(t) if t >= 0.0)
}

fn civil(epoch_secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(epoch_secs, 0).map(|dt| dt.naive_utc())
}

/// Parse both timestamps with the fixed raw layout. `None` marks an
/// unparseable value; the date stage drops those rows.
#[must_use]
pub fn parse_trip_times(trip: &RawTrip) -> (Option<i64>, Option<i64>) {
    let parse = |field: &Option<String>| {
        field
            .as_deref()
            .and_then(|raw| parse_timestamp_with(raw, TRIP_TIMESTAMP_FORMAT))
    };
    (
        parse(&trip.tpep_pickup_datetime),
        parse(&trip.tpep_dropoff_datetime),
    )
}

/// Temporal sanity: both timestamps parsed, pickup strictly before dropoff,
/// both inside the target year.
#[must_use]
pub fn date_ok(pickup: Option<i64>, dropoff: Option<i64>, target_year: i32) -> bool {
    let (Some(pickup), Some(dropoff)) = (pickup, dropoff) else {
        return false;
    };
    if pickup >= dropoff {
        return false;
    }
    match (civil(pickup), civil(dropoff)) {
        (Some(p), Some(d)) => p.year() == target_year && d.year() == target_year,
        _ => false,
    }
}

/// Attach the derived columns. Degenerate denominators yield zero rather
/// than infinities: speed is 0 when duration is non-positive, tip percentage
/// is 0 when the fare is non-positive.
#[must_use]
pub fn derive_trip(raw: RawTrip, pickup: i64, dropoff: i64) -> Option<CleanTrip> {
    let civil_pickup = civil(pickup)?;
    let duration_minutes = (dropoff - pickup) as f64 / 60.0;
    let distance = raw.trip_distance.unwrap_or(0.0);
    let fare = raw.fare_amount.unwrap_or(0.0);
    let tip = raw.tip_amount.unwrap_or(0.0);

    let speed_mph = if duration_minutes > 0.0 {
        distance / (duration_minutes / 60.0)
    } else {
        0.0
    };
    let tip_percentage = if fare > 0.0 { tip / fare * 100.0 } else { 0.0 };

    Some(CleanTrip {
        pickup,
        dropoff,
        trip_duration_minutes: duration_minutes,
        pickup_hour: i64::from(civil_pickup.hour()),
        // 1 = Sunday .. 7 = Saturday.
        pickup_day_of_week: i64::from(civil_pickup.weekday().num_days_from_sunday()) + 1,
        pickup_month: i64::from(civil_pickup.month()),
        speed_mph,
        tip_percentage,
        raw,
    })
}

/// Outlier rejection on the derived columns.
#[must_use]
pub fn range_ok(trip: &CleanTrip, config: &CleanConfig) -> bool {
    trip.trip_duration_minutes >= config.min_duration_minutes
        && trip.trip_duration_minutes <= config.max_duration_minutes
        && trip.speed_mph >= 0.0
        && trip.speed_mph <= config.max_speed_mph
        && trip.tip_percentage >= 0.0
        && trip.tip_percentage <= config.max_tip_percentage
}

fn process_partition(
    path: &Path,
    config: &CleanConfig,
) -> Result<(StageCounts, Vec<CleanTrip>), PipelineError> {
    let rows: Vec<RawTrip> =
        tg_io::read_csv_records(path).map_err(|source| PipelineError::ReadPartition {
            path: path.to_path_buf(),
            source,
        })?;

    let mut counts = StageCounts {
        read: rows.len(),
        ..StageCounts::default()
    };

    let mut kept = Vec::new();
    for raw in rows {
        if !validity_ok(&raw, config) {
            continue;
        }
        counts.after_validity += 1;

        let (pickup, dropoff) = parse_trip_times(&raw);
        if !date_ok(pickup, dropoff, config.target_year) {
            continue;
        }
        counts.after_date += 1;
        let (Some(pickup), Some(dropoff)) = (pickup, dropoff) else {
            continue;
        };

        let Some(trip) = derive_trip(raw, pickup, dropoff) else {
            continue;
        };
        if !range_ok(&trip, config) {
            continue;
        }
        counts.after_range += 1;
        kept.push(trip);
    }

    debug!(
        partition = %path.display(),
        read = counts.read,
        kept = counts.after_range,
        "partition cleaned"
    );
    Ok((counts, kept))
}

fn csv_partitions(input_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = fs::read_dir(input_dir)
        .map_err(|source| PipelineError::ListPartitions {
            path: input_dir.to_path_buf(),
            source,
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| PipelineError::ListPartitions {
            path: input_dir.to_path_buf(),
            source,
        })?;

    let mut partitions: Vec<PathBuf> = entries
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("csv"))
        .collect();
    partitions.sort();

    if partitions.is_empty() {
        return Err(PipelineError::NoPartitions {
            path: input_dir.to_path_buf(),
        });
    }
    Ok(partitions)
}

fn int_column(values: impl Iterator<Item = i64>) -> Result<Column, ColumnError> {
    Column::new(DType::Int64, values.map(Scalar::Int64).collect())
}

fn opt_int_column(values: impl Iterator<Item = Option<i64>>) -> Result<Column, ColumnError> {
    Column::new(
        DType::Int64,
        values.map(|v| v.map_or(Scalar::Null, Scalar::Int64)).collect(),
    )
}

fn float_column(values: impl Iterator<Item = f64>) -> Result<Column, ColumnError> {
    Column::new(DType::Float64, values.map(Scalar::Float64).collect())
}

fn opt_float_column(values: impl Iterator<Item = Option<f64>>) -> Result<Column, ColumnError> {
    Column::new(
        DType::Float64,
        values
            .map(|v| v.map_or(Scalar::Null, Scalar::Float64))
            .collect(),
    )
}

fn output_columns(trips: &[CleanTrip]) -> Result<Vec<(String, Column)>, ColumnError> {
    let timestamp = |values: Vec<Scalar>| Column::new(DType::Timestamp, values);
    let flag = Column::new(
        DType::Utf8,
        trips
            .iter()
            .map(|t| {
                t.raw
                    .store_and_fwd_flag
                    .clone()
                    .map_or(Scalar::Null, Scalar::Utf8)
            })
            .collect(),
    )?;

    Ok(vec![
        (
            "vendor_id".into(),
            opt_int_column(trips.iter().map(|t| t.raw.vendor_id))?,
        ),
        (
            "pickup_datetime".into(),
            timestamp(trips.iter().map(|t| Scalar::Timestamp(t.pickup)).collect())?,
        ),
        (
            "dropoff_datetime".into(),
            timestamp(trips.iter().map(|t| Scalar::Timestamp(t.dropoff)).collect())?,
        ),
        (
            "passenger_count".into(),
            opt_int_column(trips.iter().map(|t| t.raw.passenger_count))?,
        ),
        (
            "trip_distance".into(),
            opt_float_column(trips.iter().map(|t| t.raw.trip_distance))?,
        ),
        (
            "rate_code_id".into(),
            opt_int_column(trips.iter().map(|t| t.raw.rate_code_id))?,
        ),
        ("store_and_fwd_flag".into(), flag),
        (
            "pu_location_id".into(),
            opt_int_column(trips.iter().map(|t| t.raw.pu_location_id))?,
        ),
        (
            "do_location_id".into(),
            opt_int_column(trips.iter().map(|t| t.raw.do_location_id))?,
        ),
        (
            "payment_type".into(),
            opt_int_column(trips.iter().map(|t| t.raw.payment_type))?,
        ),
        (
            "fare_amount".into(),
            opt_float_column(trips.iter().map(|t| t.raw.fare_amount))?,
        ),
        (
            "extra".into(),
            opt_float_column(trips.iter().map(|t| t.raw.extra))?,
        ),
        (
            "mta_tax".into(),
            opt_float_column(trips.iter().map(|t| t.raw.mta_tax))?,
        ),
        (
            "tip_amount".into(),
            opt_float_column(trips.iter().map(|t| t.raw.tip_amount))?,
        ),
        (
            "tolls_amount".into(),
            opt_float_column(trips.iter().map(|t| t.raw.tolls_amount))?,
        ),
        (
            "improvement_surcharge".into(),
            opt_float_column(trips.iter().map(|t| t.raw.improvement_surcharge))?,
        ),
        (
            "total_amount".into(),
            opt_float_column(trips.iter().map(|t| t.raw.total_amount))?,
        ),
        (
            "trip_duration_minutes".into(),
            float_column(trips.iter().map(|t| t.trip_duration_minutes))?,
        ),
        (
            "pickup_hour".into(),
            int_column(trips.iter().map(|t| t.pickup_hour))?,
        ),
        (
            "pickup_day_of_week".into(),
            int_column(trips.iter().map(|t| t.pickup_day_of_week))?,
        ),
        (
            "pickup_month".into(),
            int_column(trips.iter().map(|t| t.pickup_month))?,
        ),
        (
            "speed_mph".into(),
            float_column(trips.iter().map(|t| t.speed_mph))?,
        ),
        (
            "tip_percentage".into(),
            float_column(trips.iter().map(|t| t.tip_percentage))?,
        ),
    ])
}

fn tmp_sibling(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map_or_else(|| "output.parquet".to_owned(), |n| n.to_string_lossy().into_owned());
    output.with_file_name(format!("{name}.tmp"))
}

/// Run the full pipeline: read every CSV partition in `input_dir` (in
/// parallel; per-partition filtering is independent, so parallelism only
/// affects final interleaving), then write one consolidated snappy parquet
/// file. The output is written to a `.tmp` sibling and renamed, so a failed
/// run leaves no partial output.
pub fn run(
    input_dir: &Path,
    output: &Path,
    config: &CleanConfig,
) -> Result<CleanReport, PipelineError> {
    let partitions = csv_partitions(input_dir)?;
    info!(
        input = %input_dir.display(),
        partitions = partitions.len(),
        "starting clean run"
    );

    let results: Vec<(StageCounts, Vec<CleanTrip>)> = partitions
        .par_iter()
        .map(|path| process_partition(path, config))
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = StageCounts::default();
    let mut trips: Vec<CleanTrip> = Vec::new();
    for (partition_counts, mut kept) in results {
        counts.add(partition_counts);
        trips.append(&mut kept);
    }

    info!(
        read = counts.read,
        after_validity = counts.after_validity,
        after_date = counts.after_date,
        after_range = counts.after_range,
        "stage counts"
    );

    let columns = output_columns(&trips)?;
    let tmp = tmp_sibling(output);
    tg_io::write_parquet(&tmp, &columns).map_err(|source| PipelineError::WriteOutput {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, output).map_err(|source| PipelineError::Commit {
        tmp,
        path: output.to_path_buf(),
        source,
    })?;

    info!(output = %output.display(), rows = trips.len(), "clean run committed");
    Ok(CleanReport {
        partitions: partitions.len(),
        counts,
        output: output.to_path_buf(),
    })
}
