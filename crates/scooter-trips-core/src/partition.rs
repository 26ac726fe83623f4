//! Hive-style spatio-temporal partitioning.
//!
//! A trip belongs to the cell named by its start year and month and by the
//! 0.1° grid square of the first point of its path:
//!
//! ```text
//! <root>/year=2023/month=5/grid_lat=476/grid_lon=-1224/data_0.parquet
//! ```
//!
//! Grid indices are `floor(degrees * 10)`, so negative coordinates round
//! towards negative infinity (-122.35 lands in -1224, not -1223). The
//! partition values live only in the directory names; the files themselves
//! keep the flat trip schema.
//!
//! [`PartitionWriter`] receives batches in any order and routes each row to
//! its cell. A cell whose `data_0.parquet` already exists when it is first
//! touched is left as is and its rows are only counted ("overwrite or
//! ignore"), which makes re-running a year that was already written a no-op.
//!
//! Rows are buffered per cell and no file is held open between calls. Over
//! the memory limit, the largest buffers are spilled to closed side files
//! (`data_0.parquet.<n>.spill`). [`PartitionWriter::finish`] writes each cell
//! to `data_0.parquet.tmp` and renames it into place, so a `data_0.parquet`
//! is always complete. Spill and temp files are removed when the writer is
//! dropped, whether it finished or not.

use std::{
    collections::{HashMap, hash_map::Entry},
    fs::File,
    path::{Path, PathBuf},
};

use arrow::array::{Array, ListArray, RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use chrono::{Datelike, NaiveDateTime};
use log::{debug, info};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::storage::{self, StorageError, TempFileGuard};
use crate::trip::{self, PATH, START_TIMESTAMP, TripError};

/// Directory key for the start year.
pub const YEAR_KEY: &str = "year";
/// Directory key for the start month (1-12, not zero padded).
pub const MONTH_KEY: &str = "month";
/// Directory key for the latitude grid index.
pub const GRID_LAT_KEY: &str = "grid_lat";
/// Directory key for the longitude grid index.
pub const GRID_LON_KEY: &str = "grid_lon";
/// File written inside every partition directory.
pub const PARTITION_FILE_NAME: &str = "data_0.parquet";

/// Grid cells per degree.
const GRID_CELLS_PER_DEGREE: f64 = 10.0;

/// Errors raised while writing partitions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PartitionError {
    /// An input batch does not have the expected trip columns.
    #[snafu(display("Input batch is not a trip batch: {source}"))]
    InputSchema {
        /// Underlying schema error.
        source: TripError,
    },

    /// Splitting a batch by partition failed.
    #[snafu(display("Failed to split batch by partition: {source}"))]
    Split {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A partition directory could not be created.
    #[snafu(display("Failed to prepare partition directory: {source}"))]
    PrepareDir {
        /// Underlying storage error.
        source: StorageError,
    },

    /// A partition file could not be created.
    #[snafu(display("Failed to create partition file {path}: {source}"))]
    CreateFile {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing or closing a partition file failed.
    #[snafu(display("Failed to write partition file {path}: {source}"))]
    WriteFile {
        /// File path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// A spill file could not be opened for reading.
    #[snafu(display("Failed to open spill file {path}: {source}"))]
    OpenSpill {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A spill file could not be read back.
    #[snafu(display("Failed to read spill file {path}: {source}"))]
    ReadSpill {
        /// File path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// A batch inside a spill file could not be decoded.
    #[snafu(display("Failed to decode spill file {path}: {source}"))]
    DecodeSpill {
        /// File path.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The finished temp file could not be renamed into place.
    #[snafu(display("Failed to publish partition file {path}: {source}"))]
    Publish {
        /// Final file path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Result alias for partition writing.
pub type PartitionResult<T> = Result<T, PartitionError>;

/// Grid index for a coordinate in degrees.
///
/// # Examples
///
/// ```
/// use scooter_trips_core::partition::grid_cell;
///
/// assert_eq!(grid_cell(47.61), 476);
/// assert_eq!(grid_cell(-122.35), -1224);
/// assert_eq!(grid_cell(0.0), 0);
/// ```
pub fn grid_cell(degrees: f64) -> i32 {
    (degrees * GRID_CELLS_PER_DEGREE).floor() as i32
}

/// Identifies one partition cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Calendar year of the trip start.
    pub year: i32,
    /// Calendar month of the trip start, 1-12.
    pub month: u32,
    /// `floor(latitude * 10)` of the first path sample.
    pub grid_lat: i32,
    /// `floor(longitude * 10)` of the first path sample.
    pub grid_lon: i32,
}

impl PartitionKey {
    /// Key for a trip starting at `start` whose path begins at `(lat, lon)`.
    ///
    /// Returns `None` when either coordinate is not finite.
    pub fn derive(start: NaiveDateTime, latitude: f64, longitude: f64) -> Option<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        Some(Self {
            year: start.year(),
            month: start.month(),
            grid_lat: grid_cell(latitude),
            grid_lon: grid_cell(longitude),
        })
    }

    /// Directory of this cell relative to the dataset root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("{YEAR_KEY}={}", self.year))
            .join(format!("{MONTH_KEY}={}", self.month))
            .join(format!("{GRID_LAT_KEY}={}", self.grid_lat))
            .join(format!("{GRID_LON_KEY}={}", self.grid_lon))
    }

    /// Path of this cell's data file under `root`.
    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(self.relative_dir()).join(PARTITION_FILE_NAME)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{YEAR_KEY}={}/{MONTH_KEY}={}/{GRID_LAT_KEY}={}/{GRID_LON_KEY}={}",
            self.year, self.month, self.grid_lat, self.grid_lon
        )
    }
}

/// Counters reported by [`PartitionWriter::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionReport {
    /// Cells that received a new file.
    pub cells_written: usize,
    /// Rows written into new files.
    pub rows_written: usize,
    /// Cells skipped because their file already existed.
    pub cells_ignored: usize,
    /// Rows that mapped to a skipped cell.
    pub rows_ignored: usize,
    /// Rows without a partition key (no start, empty path, bad first point).
    pub rows_excluded: usize,
}

impl PartitionReport {
    /// Add `other`'s counters to `self`.
    pub fn merge(&mut self, other: &PartitionReport) {
        self.cells_written += other.cells_written;
        self.rows_written += other.rows_written;
        self.cells_ignored += other.cells_ignored;
        self.rows_ignored += other.rows_ignored;
        self.rows_excluded += other.rows_excluded;
    }
}

/// Buffered rows of one cell that still has to be written.
struct PendingCell {
    schema: SchemaRef,
    buffered: Vec<RecordBatch>,
    buffered_bytes: usize,
    rows: usize,
    spills: Vec<TempFileGuard>,
}

impl PendingCell {
    fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            buffered: Vec::new(),
            buffered_bytes: 0,
            rows: 0,
            spills: Vec::new(),
        }
    }

    fn push(&mut self, part: RecordBatch) {
        self.buffered_bytes += part.get_array_memory_size();
        self.rows += part.num_rows();
        self.buffered.push(part);
    }

    /// Move the buffered rows into a new closed spill file inside `dir`.
    fn spill(&mut self, dir: &Path) -> PartitionResult<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        storage::ensure_dir(dir).context(PrepareDirSnafu)?;

        let path = dir.join(format!("{PARTITION_FILE_NAME}.{}.spill", self.spills.len()));
        let guard = TempFileGuard::new(path.clone());
        let file = File::create(&path).context(CreateFileSnafu {
            path: path.display().to_string(),
        })?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), None).context(
            WriteFileSnafu {
                path: path.display().to_string(),
            },
        )?;
        for batch in self.buffered.drain(..) {
            writer.write(&batch).context(WriteFileSnafu {
                path: path.display().to_string(),
            })?;
        }
        writer.close().context(WriteFileSnafu {
            path: path.display().to_string(),
        })?;

        self.spills.push(guard);
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Write spills and buffer to `<dir>/data_0.parquet.tmp`, then rename it
    /// to `target`. Returns the number of rows written.
    fn publish(self, dir: &Path, target: &Path) -> PartitionResult<usize> {
        let tmp = dir.join(format!("{PARTITION_FILE_NAME}.tmp"));
        let mut guard = TempFileGuard::new(tmp.clone());

        let file = File::create(&tmp).context(CreateFileSnafu {
            path: tmp.display().to_string(),
        })?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), None).context(
            WriteFileSnafu {
                path: tmp.display().to_string(),
            },
        )?;

        for spill in &self.spills {
            for batch in read_spill(spill.path())? {
                let batch = batch.context(DecodeSpillSnafu {
                    path: spill.path().display().to_string(),
                })?;
                writer.write(&batch).context(WriteFileSnafu {
                    path: tmp.display().to_string(),
                })?;
            }
        }
        for batch in &self.buffered {
            writer.write(batch).context(WriteFileSnafu {
                path: tmp.display().to_string(),
            })?;
        }
        writer.close().context(WriteFileSnafu {
            path: tmp.display().to_string(),
        })?;

        std::fs::rename(&tmp, target).context(PublishSnafu {
            path: target.display().to_string(),
        })?;
        guard.disarm();
        Ok(self.rows)
    }
}

fn read_spill(path: &Path) -> PartitionResult<ParquetRecordBatchReader> {
    let file = File::open(path).context(OpenSpillSnafu {
        path: path.display().to_string(),
    })?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .context(ReadSpillSnafu {
            path: path.display().to_string(),
        })
}

enum Cell {
    Pending(PendingCell),
    Ignored { rows: usize },
}

/// Routes trip rows into per-cell Parquet files under a root directory.
pub struct PartitionWriter {
    root: PathBuf,
    memory_limit: Option<usize>,
    cells: HashMap<PartitionKey, Cell>,
    rows_excluded: usize,
}

impl std::fmt::Debug for PartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWriter")
            .field("root", &self.root)
            .field("memory_limit", &self.memory_limit)
            .field("cells", &self.cells.len())
            .field("rows_excluded", &self.rows_excluded)
            .finish()
    }
}

impl PartitionWriter {
    /// Create a writer rooted at `root`. Nothing is touched on disk until
    /// a spill or [`finish`](Self::finish).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            memory_limit: None,
            cells: HashMap::new(),
            rows_excluded: 0,
        }
    }

    /// Spill buffered rows once their combined size exceeds `bytes`.
    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Root directory of the partitioned dataset.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition key of every row in `batch`, `None` for excluded rows.
    ///
    /// The batch must carry `start_timestamp` and `path`.
    pub fn partition_keys(batch: &RecordBatch) -> PartitionResult<Vec<Option<PartitionKey>>> {
        let starts = batch
            .column_by_name(START_TIMESTAMP)
            .context(trip::MissingColumnSnafu {
                column: START_TIMESTAMP,
            })
            .context(InputSchemaSnafu)?;
        let starts = trip::timestamps_micros(START_TIMESTAMP, starts).context(InputSchemaSnafu)?;

        let paths = batch
            .column_by_name(PATH)
            .context(trip::MissingColumnSnafu { column: PATH })
            .context(InputSchemaSnafu)?;
        let paths = paths
            .as_any()
            .downcast_ref::<ListArray>()
            .context(trip::ColumnTypeSnafu {
                column: PATH,
                data_type: paths.data_type().clone(),
            })
            .context(InputSchemaSnafu)?;

        Ok((0..batch.num_rows())
            .map(|row| {
                if starts.is_null(row) {
                    return None;
                }
                let start = trip::naive_from_micros(starts.value(row))?;
                let (lat, lon) = trip::first_position(paths, row)?;
                PartitionKey::derive(start, lat, lon)
            })
            .collect())
    }

    /// Route every row of `batch` to its cell.
    pub fn write(&mut self, batch: &RecordBatch) -> PartitionResult<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let keys = Self::partition_keys(batch)?;
        let mut groups: HashMap<PartitionKey, Vec<u32>> = HashMap::new();
        for (row, key) in keys.into_iter().enumerate() {
            match key {
                Some(key) => groups.entry(key).or_default().push(row as u32),
                None => self.rows_excluded += 1,
            }
        }

        for (key, rows) in groups {
            match self.cell(key, batch) {
                Cell::Ignored { rows: ignored } => *ignored += rows.len(),
                Cell::Pending(cell) => {
                    let indices = UInt32Array::from(rows);
                    cell.push(take_record_batch(batch, &indices).context(SplitSnafu)?);
                }
            }
        }

        self.enforce_memory_limit()
    }

    fn cell(&mut self, key: PartitionKey, batch: &RecordBatch) -> &mut Cell {
        match self.cells.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let cell = if key.file_path(&self.root).exists() {
                    debug!("{key}: {PARTITION_FILE_NAME} exists, leaving it untouched");
                    Cell::Ignored { rows: 0 }
                } else {
                    Cell::Pending(PendingCell::new(batch.schema()))
                };
                e.insert(cell)
            }
        }
    }

    /// Bytes of row data currently held in memory across all cells.
    pub fn buffered_bytes(&self) -> usize {
        self.cells
            .values()
            .map(|cell| match cell {
                Cell::Pending(cell) => cell.buffered_bytes,
                Cell::Ignored { .. } => 0,
            })
            .sum()
    }

    /// Over the limit, spill the largest buffers until at most half of the
    /// limit stays in memory.
    fn enforce_memory_limit(&mut self) -> PartitionResult<()> {
        let Some(limit) = self.memory_limit else {
            return Ok(());
        };
        let mut buffered = self.buffered_bytes();
        if buffered <= limit {
            return Ok(());
        }

        debug!("spilling partition buffers: {buffered} bytes over limit {limit}");
        let mut largest: Vec<(PartitionKey, usize)> = self
            .cells
            .iter()
            .filter_map(|(key, cell)| match cell {
                Cell::Pending(cell) if cell.buffered_bytes > 0 => {
                    Some((*key, cell.buffered_bytes))
                }
                _ => None,
            })
            .collect();
        largest.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let target = limit / 2;
        for (key, bytes) in largest {
            if buffered <= target {
                break;
            }
            if let Some(Cell::Pending(cell)) = self.cells.get_mut(&key) {
                cell.spill(&self.root.join(key.relative_dir()))?;
            }
            buffered = buffered.saturating_sub(bytes);
        }
        Ok(())
    }

    /// Write every pending cell and return the counters.
    ///
    /// All cell directories are created before the first file is written, so
    /// a path that cannot be created fails the call without publishing
    /// anything.
    pub fn finish(self) -> PartitionResult<PartitionReport> {
        let mut report = PartitionReport {
            rows_excluded: self.rows_excluded,
            ..PartitionReport::default()
        };

        let mut cells: Vec<_> = self.cells.into_iter().collect();
        cells.sort_unstable_by_key(|(key, _)| *key);

        for (key, cell) in &cells {
            if let Cell::Pending(_) = cell {
                storage::ensure_dir(&self.root.join(key.relative_dir()))
                    .context(PrepareDirSnafu)?;
            }
        }

        for (key, cell) in cells {
            match cell {
                Cell::Pending(cell) => {
                    let dir = self.root.join(key.relative_dir());
                    report.rows_written += cell.publish(&dir, &key.file_path(&self.root))?;
                    report.cells_written += 1;
                }
                Cell::Ignored { rows } => {
                    report.cells_ignored += 1;
                    report.rows_ignored += rows;
                }
            }
        }

        info!(
            "partitioned {} rows into {} cells under {} ({} cells skipped, {} rows excluded)",
            report.rows_written,
            report.cells_written,
            self.root.display(),
            report.cells_ignored,
            report.rows_excluded
        );
        Ok(report)
    }
}
