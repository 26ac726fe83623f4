//! Error types for the engine layer.
//!
//! [`EngineError`] covers offline jobs (repartitioning, summarizing) and any
//! DataFusion failure. [`ServiceError`] is what the query service returns; it
//! separates "there is no data" and "the request is invalid" from everything
//! else so the HTTP layer can pick a status code without string matching.

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use scooter_trips_core::{
    MetadataError, PartitionError, TripError, storage::StorageError,
};
use snafu::prelude::*;

/// Errors from engine-backed operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// DataFusion failed to plan or execute a query.
    #[snafu(display("Query engine error: {source}"))]
    DataFusion {
        /// Underlying DataFusion error.
        #[snafu(source(from(DataFusionError, Box::new)))]
        source: Box<DataFusionError>,
    },

    /// A query result could not be decoded.
    #[snafu(display("Failed to decode query result: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A query result did not look like trip data.
    #[snafu(display("Unexpected trip data: {source}"))]
    Trip {
        /// Underlying conversion error.
        source: TripError,
    },

    /// A dataset directory does not exist.
    #[snafu(display("Dataset directory not found: {path}"))]
    DatasetMissing {
        /// The directory that was expected.
        path: String,
    },

    /// A dataset directory exists but holds no Parquet files.
    #[snafu(display("No Parquet files found under {path}"))]
    NoParquetFiles {
        /// The directory that was scanned.
        path: String,
    },

    /// Filesystem access failed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Writing partition files failed.
    #[snafu(display("Partition write failed: {source}"))]
    Partition {
        /// Underlying partition error.
        source: PartitionError,
    },

    /// Reading or writing the metadata artifact failed.
    #[snafu(display("Metadata error: {source}"))]
    Metadata {
        /// Underlying metadata error.
        source: MetadataError,
    },

    /// A year outside the representable calendar range was requested.
    #[snafu(display("Year {year} is out of range"))]
    InvalidYear {
        /// The offending year.
        year: i32,
    },
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by the query service.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    /// No dataset has been produced yet.
    #[snafu(display("No data available"))]
    NoData,

    /// The request parameters are invalid.
    #[snafu(display("{message}"))]
    InvalidQuery {
        /// What is wrong with the request.
        message: String,
    },

    /// The engine failed while answering a valid request.
    #[snafu(display("{source}"))]
    Engine {
        /// Underlying engine error.
        source: EngineError,
    },
}

/// Result alias for the query service.
pub type ServiceResult<T> = Result<T, ServiceError>;
