//! CLI for the scooter trip pipeline: ingest, repartition, summarize, query,
//! measure sampling intervals and serve.

mod error;
mod preview;
mod server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use log::warn;
use scooter_trips_core::ingest::{self, DEFAULT_BATCH_SIZE, IngestOptions};
use scooter_trips_datafusion::intervals::DEFAULT_INTERVAL_TRIPS;
use scooter_trips_datafusion::service::{DEFAULT_SAMPLE_LIMIT, MAX_SAMPLE_LIMIT, parse_time_bound};
use scooter_trips_datafusion::settings::parse_memory_size;
use scooter_trips_datafusion::{
    BoundingBox, EngineSettings, RepartitionOptions, SampleQuery, ServiceConfig, TripQueries,
    TripQueryService, generate_metadata, repartition, sample_intervals,
};
use snafu::{ResultExt, ensure};

use crate::{
    error::{
        AllInputsFailedSnafu, AllYearsFailedSnafu, CliError, CliResult, EngineSnafu, IngestSnafu,
        IngestTaskSnafu, JsonSnafu, NoCsvInputsSnafu, QuerySnafu,
    },
    server::{DEFAULT_BIND, ServerConfig},
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert raw trip CSV exports into flat Parquet chunks
    Ingest {
        /// CSV files or directories containing them
        #[arg(long = "input", required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,

        #[arg(long)]
        output: PathBuf,

        /// Rows per batch (and per output file)
        #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Threads used to parse routes (default: all cores)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Rewrite the flat dataset as year/month/grid partitions
    Repartition {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Only these years (repeatable; default: every year in the data)
        #[arg(long = "year")]
        years: Vec<i32>,

        #[command(flatten)]
        engine: EngineArgs,

        /// Keep source file order instead of repartitioning scans
        #[arg(long = "preserve-order", default_value_t = false)]
        preserve_order: bool,
    },

    /// Precompute metadata.json for a dataset
    Metadata {
        #[arg(long)]
        data: PathBuf,

        /// Output path (default: <data>/metadata.json)
        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print corpus statistics
    Stats {
        #[arg(long)]
        data: PathBuf,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print a sample of trips
    Sample {
        #[arg(long)]
        data: PathBuf,

        #[command(flatten)]
        filter: SampleArgs,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Report how often trip paths were sampled
    Intervals {
        #[arg(long)]
        data: PathBuf,

        /// Number of trips to read
        #[arg(long, default_value_t = DEFAULT_INTERVAL_TRIPS)]
        trips: usize,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Serve the stats/sample HTTP API
    Serve {
        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value = DEFAULT_BIND)]
        bind: SocketAddr,

        /// Directory with a front-end to serve at /
        #[arg(long = "static-dir")]
        static_dir: Option<PathBuf>,

        #[arg(long = "default-limit", default_value_t = DEFAULT_SAMPLE_LIMIT)]
        default_limit: usize,

        #[arg(long = "max-limit", default_value_t = MAX_SAMPLE_LIMIT)]
        max_limit: usize,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Debug, clap::Args)]
struct EngineArgs {
    /// Engine worker threads (default: all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Engine memory ceiling, e.g. 4GB
    #[arg(long = "memory-limit", value_parser = parse_memory_limit)]
    memory_limit: Option<usize>,
}

impl EngineArgs {
    fn settings(&self, preserve_order: bool) -> EngineSettings {
        EngineSettings {
            threads: self.threads,
            memory_limit: self.memory_limit,
            preserve_order,
        }
    }
}

#[derive(Debug, clap::Args)]
struct SampleArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Earliest start (RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`)
    #[arg(long)]
    start: Option<String>,

    /// Latest end
    #[arg(long)]
    end: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    north: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    south: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    east: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    west: Option<f64>,
}

impl SampleArgs {
    fn to_query(&self) -> CliResult<SampleQuery> {
        let bound = |v: &Option<String>| {
            v.as_deref()
                .map(parse_time_bound)
                .transpose()
                .context(QuerySnafu)
        };
        Ok(SampleQuery {
            limit: Some(self.limit),
            start: bound(&self.start)?,
            end: bound(&self.end)?,
            bbox: BoundingBox::from_parts(self.north, self.south, self.east, self.west)
                .context(QuerySnafu)?,
        })
    }
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn parse_memory_limit(value: &str) -> Result<usize, String> {
    parse_memory_size(value).ok_or_else(|| {
        CliError::InvalidMemoryLimit {
            value: value.to_string(),
        }
        .to_string()
    })
}

fn collect_csv_inputs(inputs: &[PathBuf]) -> CliResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let found = ingest::discover_csv_files(input).context(IngestSnafu)?;
            ensure!(
                !found.is_empty(),
                NoCsvInputsSnafu {
                    path: input.display().to_string(),
                }
            );
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

async fn cmd_ingest(
    inputs: Vec<PathBuf>,
    output: PathBuf,
    options: IngestOptions,
) -> CliResult<()> {
    let start = Instant::now();
    let files = collect_csv_inputs(&inputs)?;
    let total = files.len();

    let out_dir = output.clone();
    let report = tokio::task::spawn_blocking(move || ingest::ingest_files(&files, &out_dir, &options))
        .await
        .context(IngestTaskSnafu)?
        .context(IngestSnafu)?;

    for (path, e) in &report.failed_files {
        eprintln!("Skipped {}: {e}", path.display());
    }
    ensure!(
        !report.files.is_empty() || total == 0,
        AllInputsFailedSnafu { count: total }
    );

    let chunks: usize = report.files.iter().map(|f| f.outputs.len()).sum();
    println!(
        "Ingested {} of {total} files: {} rows in {chunks} chunks under {} (elapsed_ms: {})",
        report.files.len(),
        report.rows_written(),
        output.display(),
        start.elapsed().as_millis()
    );
    Ok(())
}

async fn cmd_repartition(input: &Path, output: &Path, options: RepartitionOptions) -> CliResult<()> {
    let start = Instant::now();
    let report = repartition(input, output, &options)
        .await
        .context(EngineSnafu)?;

    for (year, r) in &report.years {
        println!(
            "{year}: {} rows into {} cells ({} cells already present, {} rows excluded)",
            r.rows_written, r.cells_written, r.cells_ignored, r.rows_excluded
        );
    }
    for (year, e) in &report.failed_years {
        eprintln!("{year}: failed: {e}");
    }
    ensure!(
        !report.years.is_empty() || report.failed_years.is_empty(),
        AllYearsFailedSnafu {
            count: report.failed_years.len(),
        }
    );

    println!(
        "Repartitioned into {} (elapsed_ms: {})",
        output.display(),
        start.elapsed().as_millis()
    );
    Ok(())
}

async fn cmd_metadata(data: &Path, output: Option<&Path>, settings: EngineSettings) -> CliResult<()> {
    let summary = generate_metadata(data, output, &settings)
        .await
        .context(EngineSnafu)?;
    println!("{}", preview::render_stats(&summary));
    Ok(())
}

async fn cmd_stats(data: &Path, json: bool) -> CliResult<()> {
    let service = TripQueryService::new(ServiceConfig::new(data));
    let stats = service.stats().await.context(QuerySnafu)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context(JsonSnafu)?
        );
    } else {
        println!("{}", preview::render_stats(&stats));
    }
    Ok(())
}

async fn cmd_sample(data: &Path, filter: &SampleArgs, json: bool) -> CliResult<()> {
    let query = filter.to_query()?;
    let mut config = ServiceConfig::new(data);
    config.max_limit = config.max_limit.max(filter.limit);
    let service = TripQueryService::new(config);

    let trips = service.sample(&query).await.context(QuerySnafu)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&trips).context(JsonSnafu)?
        );
    } else if trips.is_empty() {
        println!("(no rows)");
    } else {
        println!("{}", preview::render_sample(&trips));
    }
    Ok(())
}

async fn cmd_intervals(
    data: &Path,
    trips: usize,
    json: bool,
    settings: EngineSettings,
) -> CliResult<()> {
    let summary = sample_intervals(data, trips, &settings)
        .await
        .context(EngineSnafu)?;
    match (summary, json) {
        (Some(summary), true) => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context(JsonSnafu)?
        ),
        (Some(summary), false) => println!("{}", preview::render_intervals(&summary)),
        (None, true) => println!("null"),
        (None, false) => println!("No valid intervals found."),
    }
    Ok(())
}

async fn cmd_serve(config: ServiceConfig, server: ServerConfig) -> CliResult<()> {
    if !config.dataset_root.exists() {
        warn!(
            "{} does not exist yet; queries return 503 until it does",
            config.dataset_root.display()
        );
    }
    let queries: Arc<dyn TripQueries> = Arc::new(TripQueryService::new(config));
    server::serve(server, queries).await
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Ingest {
            inputs,
            output,
            batch_size,
            threads,
        } => {
            let options = IngestOptions {
                batch_size,
                threads,
            };
            cmd_ingest(inputs, output, options).await
        }

        Command::Repartition {
            input,
            output,
            years,
            engine,
            preserve_order,
        } => {
            let options = RepartitionOptions {
                years: (!years.is_empty()).then_some(years),
                engine: engine.settings(preserve_order),
            };
            cmd_repartition(&input, &output, options).await
        }

        Command::Metadata {
            data,
            output,
            engine,
        } => cmd_metadata(&data, output.as_deref(), engine.settings(false)).await,

        Command::Stats { data, json } => cmd_stats(&data, json).await,

        Command::Sample { data, filter, json } => cmd_sample(&data, &filter, json).await,

        Command::Intervals {
            data,
            trips,
            json,
            engine,
        } => cmd_intervals(&data, trips, json, engine.settings(false)).await,

        Command::Serve {
            data,
            bind,
            static_dir,
            default_limit,
            max_limit,
            engine,
        } => {
            let mut config = ServiceConfig::new(data);
            config.default_limit = default_limit;
            config.max_limit = max_limit;
            config.engine = engine.settings(false);
            cmd_serve(config, ServerConfig { bind, static_dir }).await
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
