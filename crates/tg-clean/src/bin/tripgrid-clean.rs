use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tg_clean::{run, CleanConfig};

/// Clean raw trip-record CSV partitions into one columnar parquet file.
#[derive(Debug, Parser)]
#[command(name = "tripgrid-clean", version)]
struct Args {
    /// Directory holding the raw CSV partitions.
    input: PathBuf,
    /// Destination parquet file.
    #[arg(short, long)]
    output: PathBuf,
    /// Trips outside this calendar year are dropped.
    #[arg(long, default_value_t = 2018)]
    year: i32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = CleanConfig {
        target_year: args.year,
        ..CleanConfig::default()
    };

    match run(&args.input, &args.output, &config) {
        Ok(report) => {
            info!(
                partitions = report.partitions,
                read = report.counts.read,
                written = report.counts.after_range,
                output = %report.output.display(),
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "clean run failed");
            ExitCode::FAILURE
        }
    }
}
