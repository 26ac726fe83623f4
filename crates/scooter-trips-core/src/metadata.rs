//! Corpus metadata artifact.
//!
//! `metadata.json` sits at the root of the partitioned dataset and caches the
//! three numbers the stats endpoint needs, so serving does not have to scan
//! every file:
//!
//! ```json
//! {
//!   "total_records": 1284,
//!   "start_date": "2023-05-01T00:00:17.660000",
//!   "end_date": "2023-05-31T23:58:02",
//!   "generated_at": 1700000000.123
//! }
//! ```
//!
//! Dates are naive ISO-8601 strings (UTC wall clock); both are `null` for an
//! empty dataset. `generated_at` is only present on persisted artifacts.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::storage::{self, StorageError};

/// File name of the artifact inside the dataset root.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Errors reading or writing the metadata artifact.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetadataError {
    /// No artifact exists at the expected path.
    #[snafu(display("Metadata file not found: {path}"))]
    NotFound {
        /// Expected path.
        path: String,
    },

    /// Reading or writing the artifact failed.
    #[snafu(display("Metadata I/O error: {source}"))]
    Io {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The artifact exists but is not valid JSON of the expected shape.
    #[snafu(display("Failed to parse metadata at {path}: {source}"))]
    Parse {
        /// Artifact path.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The summary could not be encoded.
    #[snafu(display("Failed to encode metadata: {source}"))]
    Encode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

impl MetadataError {
    /// True if no artifact exists yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound { .. })
    }
}

/// Result alias for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Summary of the whole trip corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusMetadata {
    /// Number of trips in the dataset.
    pub total_records: u64,
    /// Earliest `start_timestamp`, ISO-8601.
    pub start_date: Option<String>,
    /// Latest `end_timestamp`, ISO-8601.
    pub end_date: Option<String>,
    /// Seconds since the epoch when the artifact was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<f64>,
}

impl CorpusMetadata {
    /// Build a summary from raw aggregates.
    pub fn new(
        total_records: u64,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Self {
        Self {
            total_records,
            start_date: start.map(iso8601),
            end_date: end.map(iso8601),
            generated_at: None,
        }
    }

    /// Summary of a dataset with no rows.
    pub fn empty() -> Self {
        Self::new(0, None, None)
    }

    /// Copy of `self` stamped with the current time.
    pub fn stamped(mut self) -> Self {
        self.generated_at = Some(now_epoch_secs());
        self
    }
}

/// Format a naive timestamp as ISO-8601.
///
/// Microseconds are only printed when non-zero.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use scooter_trips_core::metadata::iso8601;
///
/// let day = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
/// assert_eq!(iso8601(day.and_hms_opt(0, 0, 17).unwrap()), "2023-05-01T00:00:17");
/// assert_eq!(
///     iso8601(day.and_hms_micro_opt(0, 0, 17, 660_000).unwrap()),
///     "2023-05-01T00:00:17.660000"
/// );
/// ```
pub fn iso8601(ts: NaiveDateTime) -> String {
    let micros = ts.nanosecond() / 1_000;
    if micros == 0 {
        ts.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        format!("{}.{micros:06}", ts.format("%Y-%m-%dT%H:%M:%S"))
    }
}

/// Current time in seconds since the Unix epoch.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Location of the artifact for a dataset rooted at `root`.
pub fn metadata_path(root: &Path) -> PathBuf {
    root.join(METADATA_FILE_NAME)
}

/// Persist `metadata` atomically at `path`.
pub async fn write_metadata(path: &Path, metadata: &CorpusMetadata) -> MetadataResult<()> {
    let json = serde_json::to_vec_pretty(metadata).context(EncodeSnafu)?;
    storage::write_atomic(path, &json).await.context(IoSnafu)
}

/// Load the artifact at `path`.
pub async fn read_metadata(path: &Path) -> MetadataResult<CorpusMetadata> {
    let text = match storage::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.is_not_found() => {
            return NotFoundSnafu {
                path: path.display().to_string(),
            }
            .fail();
        }
        Err(e) => return Err(MetadataError::Io { source: e }),
    };

    serde_json::from_str(&text).context(ParseSnafu {
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn persisted_metadata_reads_back() -> TestResult {
        let tmp = TempDir::new()?;
        let path = metadata_path(tmp.path());
        let start = NaiveDate::from_ymd_opt(2023, 5, 1)
            .and_then(|d| d.and_hms_milli_opt(0, 0, 17, 660))
            .unwrap();
        let meta = CorpusMetadata::new(3, Some(start), Some(start)).stamped();

        write_metadata(&path, &meta).await?;
        let back = read_metadata(&path).await?;

        assert_eq!(back, meta);
        assert_eq!(back.start_date.as_deref(), Some("2023-05-01T00:00:17.660000"));
        assert!(back.generated_at.is_some());
        Ok(())
    }

    #[test]
    fn live_summary_omits_generated_at() -> TestResult {
        let json = serde_json::to_value(CorpusMetadata::empty())?;
        assert_eq!(
            json,
            serde_json::json!({"total_records": 0, "start_date": null, "end_date": null})
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_and_corrupt_artifacts_are_distinguished() -> TestResult {
        let tmp = TempDir::new()?;
        let path = metadata_path(tmp.path());

        let err = read_metadata(&path).await.unwrap_err();
        assert!(err.is_not_found());

        std::fs::write(&path, b"{not json")?;
        let err = read_metadata(&path).await.unwrap_err();
        assert!(matches!(err, MetadataError::Parse { .. }));
        Ok(())
    }
}
