//! Filesystem helpers.
//!
//! Everything the pipeline does on disk goes through a handful of helpers:
//!
//! - [`write_atomic`] replaces a small artifact (the metadata JSON) with
//!   write-then-rename semantics so readers never observe a torn file.
//! - [`read_to_string`] classifies "not found" separately from other I/O
//!   errors, which lets the serving layer fall back to a live scan.
//! - [`contains_parquet`] answers "is there any data under this root" for
//!   both the flat and the partitioned layout.

use snafu::{Backtrace, prelude::*};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// File extension used for every columnar file the pipeline writes.
pub const PARQUET_EXTENSION: &str = "parquet";

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Any other I/O error on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// True if this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            path,
            source: e,
            backtrace: Backtrace::capture(),
        }
    } else {
        StorageError::OtherIo {
            path,
            source: e,
            backtrace: Backtrace::capture(),
        }
    }
}

/// Guard that removes a temporary file on drop unless disarmed.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; call after it has been renamed into place.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are already on an error path.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `path`, replacing any previous file atomically.
///
/// The payload goes to a sibling `*.tmp` file which is synced and then
/// renamed over the target. Parent directories are created as needed.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.context(OtherIoSnafu {
            path: parent.display().to_string(),
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path).await.context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

        file.write_all(contents).await.context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

        file.sync_all().await.context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;
    }

    fs::rename(&tmp_path, path).await.context(OtherIoSnafu {
        path: path.display().to_string(),
    })?;

    guard.disarm();
    Ok(())
}

/// Read the file at `path` into a `String`.
///
/// A missing file yields [`StorageError::NotFound`]; other failures yield
/// [`StorageError::OtherIo`].
pub async fn read_to_string(path: &Path) -> StorageResult<String> {
    fs::read_to_string(path).await.map_err(|e| classify(path, e))
}

/// Create `dir` and all of its parents if they are missing.
pub fn ensure_dir(dir: &Path) -> StorageResult<()> {
    std::fs::create_dir_all(dir).context(OtherIoSnafu {
        path: dir.display().to_string(),
    })
}

/// True if `path` has the Parquet file extension.
pub fn is_parquet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PARQUET_EXTENSION))
}

/// Return true if any Parquet file exists under `root` (recursively).
///
/// A missing `root` is reported as [`StorageError::NotFound`] so callers can
/// tell "no dataset" apart from "empty dataset".
pub fn contains_parquet(root: &Path) -> StorageResult<bool> {
    let entries = std::fs::read_dir(root).map_err(|e| classify(root, e))?;

    for entry in entries {
        let entry = entry.context(OtherIoSnafu {
            path: root.display().to_string(),
        })?;
        let path = entry.path();
        let file_type = entry.file_type().context(OtherIoSnafu {
            path: path.display().to_string(),
        })?;

        if file_type.is_dir() {
            if contains_parquet(&path)? {
                return Ok(true);
            }
        } else if is_parquet(&path) {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_replaces_previous_contents() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("nested/metadata.json");

        write_atomic(&path, b"first").await?;
        write_atomic(&path, b"second").await?;

        assert_eq!(read_to_string(&path).await?, "second");
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let err = read_to_string(&tmp.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn contains_parquet_walks_nested_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let nested = tmp.path().join("year=2023/month=5");
        ensure_dir(&nested)?;
        std::fs::write(tmp.path().join("metadata.json"), b"{}")?;

        assert!(!contains_parquet(tmp.path())?);

        std::fs::write(nested.join("data_0.parquet"), b"")?;
        assert!(contains_parquet(tmp.path())?);
        Ok(())
    }

    #[test]
    fn contains_parquet_reports_missing_root() {
        let err = contains_parquet(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.is_not_found());
    }
}
