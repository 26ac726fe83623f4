//! Chunked CSV ingestion.
//!
//! [`ingest_files`] turns raw trip exports into flat Parquet files:
//!
//! 1. Each source file is handled on its own; a failure is logged, recorded
//!    in [`IngestReport::failed_files`] and the next file proceeds.
//! 2. Rows are streamed in fixed-size batches ([`IngestOptions::batch_size`],
//!    10 000 by default) so memory does not grow with file size.
//! 3. Per batch: every `routes` value goes through [`parse_route`], trip
//!    start/end timestamps are derived from the date/time columns, rows with
//!    an empty path are dropped, and the survivors are projected onto the
//!    flat trip schema (optional columns the source lacks are omitted).
//! 4. Batch `i` of `trips.csv` is written to `trips_chunk_{i:04}.parquet`, so a
//!    re-run with the same batch size overwrites instead of duplicating.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::array::{
    Array, ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
    UInt32Array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow_csv::{ReaderBuilder, reader::Format};
use log::{debug, info, warn};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use snafu::prelude::*;

use crate::route::{ParsedRoute, PathSample, parse_route, parse_trip_timestamp};
use crate::storage::{self, StorageError};
use crate::trip::{
    self, DISTANCE, END_TIMESTAMP, MODEL, PATH, ROUTE_ID, START_TIMESTAMP, TRAVEL_TIME, USER_ID,
};

/// Rows per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Source column holding the route literal.
pub const ROUTES_COLUMN: &str = "routes";
/// Source column with the trip start date.
pub const START_DATE_COLUMN: &str = "start_date";
/// Source column with the trip start time of day.
pub const START_TIME_COLUMN: &str = "start_time";
/// Source column with the trip end date.
pub const END_DATE_COLUMN: &str = "end_date";
/// Source column with the trip end time of day.
pub const END_TIME_COLUMN: &str = "end_time";

const REQUIRED_COLUMNS: [&str; 5] = [
    ROUTES_COLUMN,
    START_DATE_COLUMN,
    START_TIME_COLUMN,
    END_DATE_COLUMN,
    END_TIME_COLUMN,
];

/// Errors from ingesting a single source file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    /// The source file could not be opened.
    #[snafu(display("Failed to open source CSV {path}: {source}"))]
    OpenSource {
        /// Source path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The CSV reader failed (bad header, ragged rows, bad encoding).
    #[snafu(display("Failed to read CSV {path}: {source}"))]
    ReadCsv {
        /// Source path.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The header lacks a column the pipeline cannot do without.
    #[snafu(display("Source CSV {path} is missing required column '{column}'"))]
    MissingSourceColumn {
        /// Source path.
        path: String,
        /// Column name.
        column: String,
    },

    /// The source path has no usable file stem for naming outputs.
    #[snafu(display("Cannot derive an output name from {path}"))]
    NoFileStem {
        /// Source path.
        path: String,
    },

    /// Building an output batch failed.
    #[snafu(display("Failed to build batch {batch} of {path}: {source}"))]
    BuildBatch {
        /// Source path.
        path: String,
        /// Batch index within the file.
        batch: usize,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Writing an output Parquet file failed.
    #[snafu(display("Failed to write {path}: {source}"))]
    WriteParquet {
        /// Output path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Creating an output Parquet file failed.
    #[snafu(display("Failed to create {path}: {source}"))]
    CreateOutput {
        /// Output path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Output directory could not be prepared, or inputs could not be listed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The parsing thread pool could not be created.
    #[snafu(display("Failed to build parsing thread pool: {message}"))]
    ThreadPool {
        /// Error text from rayon.
        message: String,
    },
}

/// Result alias for ingestion.
pub type IngestResult<T> = Result<T, IngestError>;

/// Tuning for ingestion.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Rows per batch (and therefore per output file).
    pub batch_size: usize,
    /// Threads used to parse routes within a batch; `None` uses the global pool.
    pub threads: Option<usize>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            threads: None,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Rows read from the source.
    pub rows_read: usize,
    /// Rows written to the output file.
    pub rows_written: usize,
    /// Rows dropped because their path came out empty.
    pub rows_dropped: usize,
    /// Individual path entries dropped across all rows.
    pub points_skipped: usize,
}

/// Outcome of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    /// Source CSV path.
    pub source: PathBuf,
    /// Output files written, in batch order.
    pub outputs: Vec<PathBuf>,
    /// Totals across batches.
    pub totals: BatchReport,
}

/// Outcome of a multi-file run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Files that were fully processed.
    pub files: Vec<FileReport>,
    /// Files that failed, with the error that stopped them.
    pub failed_files: Vec<(PathBuf, IngestError)>,
}

impl IngestReport {
    /// Total rows written across all successful files.
    pub fn rows_written(&self) -> usize {
        self.files.iter().map(|f| f.totals.rows_written).sum()
    }
}

/// Positions of the recognized columns in one source file.
#[derive(Debug, Clone)]
struct SourceColumns {
    /// Indices of the columns to read, ascending.
    projection: Vec<usize>,
    /// Optional descriptive columns present in this file, in output order.
    text: Vec<&'static str>,
    numbers: Vec<&'static str>,
}

impl SourceColumns {
    fn resolve(path: &Path, header: &Schema) -> IngestResult<Self> {
        for column in REQUIRED_COLUMNS {
            ensure!(
                header.index_of(column).is_ok(),
                MissingSourceColumnSnafu {
                    path: path.display().to_string(),
                    column,
                }
            );
        }

        let text: Vec<&'static str> = trip::OPTIONAL_TEXT_COLUMNS
            .into_iter()
            .filter(|c| header.index_of(c).is_ok())
            .collect();
        let numbers: Vec<&'static str> = trip::OPTIONAL_NUMBER_COLUMNS
            .into_iter()
            .filter(|c| header.index_of(c).is_ok())
            .collect();

        let mut projection: Vec<usize> = REQUIRED_COLUMNS
            .iter()
            .chain(text.iter())
            .chain(numbers.iter())
            .filter_map(|c| header.index_of(c).ok())
            .collect();
        projection.sort_unstable();
        projection.dedup();

        Ok(Self {
            projection,
            text,
            numbers,
        })
    }

    fn output_schema(&self) -> Arc<Schema> {
        let mut fields = Vec::with_capacity(8);
        for name in &self.text {
            fields.push(Field::new(*name, DataType::Utf8, true));
        }
        for name in &self.numbers {
            fields.push(Field::new(*name, DataType::Float64, true));
        }
        fields.push(Field::new(START_TIMESTAMP, trip::timestamp_data_type(), true));
        fields.push(Field::new(END_TIMESTAMP, trip::timestamp_data_type(), true));
        fields.push(Field::new(PATH, trip::path_data_type(), true));
        Arc::new(Schema::new(fields))
    }
}

/// Read the header and return it as an all-Utf8 schema.
fn read_header(path: &Path) -> IngestResult<Schema> {
    let file = File::open(path).context(OpenSourceSnafu {
        path: path.display().to_string(),
    })?;
    let (inferred, _) = Format::default()
        .with_header(true)
        .infer_schema(file, Some(1))
        .context(ReadCsvSnafu {
            path: path.display().to_string(),
        })?;

    // Everything is read as text; typing happens per column below.
    Ok(Schema::new(
        inferred
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

/// Output file name for batch `index` of the source with stem `stem`.
pub fn chunk_file_name(stem: &str, index: usize) -> String {
    format!("{stem}_chunk_{index:04}.parquet")
}

/// List `*.csv` files directly under `dir`, sorted by name.
pub fn discover_csv_files(dir: &Path) -> IngestResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StorageError::OtherIo {
            path: dir.display().to_string(),
            source: e,
            backtrace: snafu::Backtrace::capture(),
        })
        .context(StorageSnafu)?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Ingest every file in `inputs` into `output_dir`.
///
/// Only a failure to create `output_dir` or the thread pool is returned as an
/// error; per-file failures are collected in the report.
pub fn ingest_files(
    inputs: &[PathBuf],
    output_dir: &Path,
    options: &IngestOptions,
) -> IngestResult<IngestReport> {
    storage::ensure_dir(output_dir).context(StorageSnafu)?;
    let pool = build_pool(options.threads)?;

    let mut report = IngestReport::default();
    for (i, input) in inputs.iter().enumerate() {
        info!(
            "[{}/{}] ingesting {}",
            i + 1,
            inputs.len(),
            input.display()
        );
        match ingest_with_pool(input, output_dir, options, pool.as_ref()) {
            Ok(file_report) => {
                info!(
                    "completed {}: {} rows written, {} dropped, {} points skipped",
                    input.display(),
                    file_report.totals.rows_written,
                    file_report.totals.rows_dropped,
                    file_report.totals.points_skipped
                );
                report.files.push(file_report);
            }
            Err(e) => {
                warn!("failed to ingest {}: {e}", input.display());
                report.failed_files.push((input.clone(), e));
            }
        }
    }

    Ok(report)
}

/// Ingest a single source file into `output_dir`.
pub fn ingest_file(
    input: &Path,
    output_dir: &Path,
    options: &IngestOptions,
) -> IngestResult<FileReport> {
    storage::ensure_dir(output_dir).context(StorageSnafu)?;
    let pool = build_pool(options.threads)?;
    ingest_with_pool(input, output_dir, options, pool.as_ref())
}

fn build_pool(threads: Option<usize>) -> IngestResult<Option<rayon::ThreadPool>> {
    threads
        .map(|n| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n.max(1))
                .build()
                .map_err(|e| IngestError::ThreadPool {
                    message: e.to_string(),
                })
        })
        .transpose()
}

fn ingest_with_pool(
    input: &Path,
    output_dir: &Path,
    options: &IngestOptions,
    pool: Option<&rayon::ThreadPool>,
) -> IngestResult<FileReport> {
    let source = input.display().to_string();
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .context(NoFileStemSnafu {
            path: source.clone(),
        })?;

    let header = read_header(input)?;
    let columns = SourceColumns::resolve(input, &header)?;
    let output_schema = columns.output_schema();

    let file = File::open(input).context(OpenSourceSnafu {
        path: source.clone(),
    })?;
    let reader = ReaderBuilder::new(Arc::new(header))
        .with_format(Format::default().with_header(true))
        .with_batch_size(options.batch_size.max(1))
        .with_projection(columns.projection.clone())
        .build(file)
        .context(ReadCsvSnafu {
            path: source.clone(),
        })?;

    let mut report = FileReport {
        source: input.to_path_buf(),
        ..FileReport::default()
    };

    for (index, batch) in reader.enumerate() {
        let batch = batch.context(ReadCsvSnafu {
            path: source.clone(),
        })?;

        let parsed = parse_routes(&batch, pool);
        let (out, batch_report) = build_output_batch(&batch, parsed, &columns, &output_schema)
            .context(BuildBatchSnafu {
                path: source.clone(),
                batch: index,
            })?;

        let out_path = output_dir.join(chunk_file_name(stem, index));
        write_parquet(&out_path, &out)?;
        debug!(
            "batch {index} of {source}: {} rows read, {} written -> {}",
            batch_report.rows_read,
            batch_report.rows_written,
            out_path.display()
        );

        report.totals.rows_read += batch_report.rows_read;
        report.totals.rows_written += batch_report.rows_written;
        report.totals.rows_dropped += batch_report.rows_dropped;
        report.totals.points_skipped += batch_report.points_skipped;
        report.outputs.push(out_path);
    }

    Ok(report)
}

fn routes_column(batch: &RecordBatch) -> Option<&StringArray> {
    batch
        .column_by_name(ROUTES_COLUMN)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}

/// Parse every route in the batch, preserving row order.
fn parse_routes(batch: &RecordBatch, pool: Option<&rayon::ThreadPool>) -> Vec<ParsedRoute> {
    let Some(routes) = routes_column(batch) else {
        return vec![ParsedRoute::default(); batch.num_rows()];
    };

    let run = || {
        (0..routes.len())
            .into_par_iter()
            .map(|row| {
                if routes.is_null(row) {
                    ParsedRoute::default()
                } else {
                    parse_route(routes.value(row))
                }
            })
            .collect::<Vec<_>>()
    };

    match pool {
        Some(pool) => pool.install(run),
        None => run(),
    }
}

fn text_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, ArrowError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ArrowError::SchemaError(format!("column '{name}' is not a text column")))
}

fn derive_timestamps(
    batch: &RecordBatch,
    date_col: &str,
    time_col: &str,
    keep: &[u32],
) -> Result<TimestampMicrosecondArray, ArrowError> {
    let dates = text_column(batch, date_col)?;
    let times = text_column(batch, time_col)?;
    Ok(keep
        .iter()
        .map(|&row| {
            let row = row as usize;
            if dates.is_null(row) {
                return None;
            }
            let time = if times.is_null(row) { "" } else { times.value(row) };
            parse_trip_timestamp(dates.value(row), time)
                .map(|ts| ts.and_utc().timestamp_micros())
        })
        .collect())
}

fn parse_numbers(batch: &RecordBatch, name: &str, keep: &[u32]) -> Result<ArrayRef, ArrowError> {
    let values = text_column(batch, name)?;
    let parsed: Float64Array = keep
        .iter()
        .map(|&row| {
            let row = row as usize;
            if values.is_null(row) {
                None
            } else {
                values.value(row).trim().parse::<f64>().ok()
            }
        })
        .collect();
    Ok(Arc::new(parsed))
}

fn build_output_batch(
    batch: &RecordBatch,
    parsed: Vec<ParsedRoute>,
    columns: &SourceColumns,
    schema: &Arc<Schema>,
) -> Result<(RecordBatch, BatchReport), ArrowError> {
    let mut report = BatchReport {
        rows_read: batch.num_rows(),
        ..BatchReport::default()
    };

    let mut keep: Vec<u32> = Vec::with_capacity(parsed.len());
    let mut paths: Vec<Vec<PathSample>> = Vec::with_capacity(parsed.len());
    for (row, route) in parsed.into_iter().enumerate() {
        report.points_skipped += route.dropped_points();
        if route.is_empty() {
            report.rows_dropped += 1;
            continue;
        }
        keep.push(row as u32);
        paths.push(route.samples);
    }
    report.rows_written = keep.len();

    let indices = UInt32Array::from(keep.clone());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for name in &columns.text {
        let source = text_column(batch, name)?;
        arrays.push(take(source, &indices, None)?);
    }
    for name in &columns.numbers {
        arrays.push(parse_numbers(batch, name, &keep)?);
    }
    arrays.push(Arc::new(derive_timestamps(
        batch,
        START_DATE_COLUMN,
        START_TIME_COLUMN,
        &keep,
    )?));
    arrays.push(Arc::new(derive_timestamps(
        batch,
        END_DATE_COLUMN,
        END_TIME_COLUMN,
        &keep,
    )?));
    arrays.push(Arc::new(trip::path_array(paths.iter().map(Vec::as_slice))));

    let out = RecordBatch::try_new(Arc::clone(schema), arrays)?;
    Ok((out, report))
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> IngestResult<()> {
    let display = path.display().to_string();
    let file = File::create(path).context(CreateOutputSnafu {
        path: display.clone(),
    })?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).context(
        WriteParquetSnafu {
            path: display.clone(),
        },
    )?;
    writer.write(batch).context(WriteParquetSnafu {
        path: display.clone(),
    })?;
    writer.close().context(WriteParquetSnafu { path: display })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(names: &[&str]) -> Schema {
        Schema::new(
            names
                .iter()
                .map(|n| Field::new(*n, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn chunk_names_are_zero_padded() {
        assert_eq!(chunk_file_name("trips", 0), "trips_chunk_0000.parquet");
        assert_eq!(chunk_file_name("trips", 12), "trips_chunk_0012.parquet");
    }

    #[test]
    fn resolve_requires_route_and_time_columns() {
        let h = header(&["route_id", "routes", "start_date", "start_time", "end_date"]);
        let err = SourceColumns::resolve(Path::new("x.csv"), &h).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingSourceColumn { ref column, .. } if column == "end_time"
        ));
    }

    #[test]
    fn resolve_omits_missing_optional_columns() {
        let h = header(&[
            "distance",
            "routes",
            "start_date",
            "start_time",
            "end_date",
            "end_time",
            "unused",
            "route_id",
        ]);
        let cols = SourceColumns::resolve(Path::new("x.csv"), &h).unwrap();
        assert_eq!(cols.text, vec![ROUTE_ID]);
        assert_eq!(cols.numbers, vec![DISTANCE]);
        assert_eq!(cols.projection, vec![0, 1, 2, 3, 4, 5, 7]);

        let schema = cols.output_schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![ROUTE_ID, DISTANCE, START_TIMESTAMP, END_TIMESTAMP, PATH]
        );
        assert!(schema.index_of(USER_ID).is_err());
        assert!(schema.index_of(MODEL).is_err());
        assert!(schema.index_of(TRAVEL_TIME).is_err());
    }
}
