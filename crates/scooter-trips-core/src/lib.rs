//! Core pipeline for scooter trip exports.
//!
//! This crate turns raw trip CSV exports into a Parquet dataset that an
//! embedded analytic engine can prune by time and space:
//!
//! - Parsing of the textual route encoding into ordered [`route::PathSample`]s,
//!   dropping bad points instead of whole trips (`route` module).
//! - The flat trip schema and conversions between Arrow arrays and plain
//!   Rust values (`trip` module).
//! - Chunked CSV ingestion into one Parquet file per fixed-size batch
//!   (`ingest` module).
//! - Partition key derivation and the Hive-style partition writer used by the
//!   repartitioner (`partition` module).
//! - The corpus metadata artifact consumed by the serving layer
//!   (`metadata` module).
//! - Sampling-interval statistics over trip paths (`intervals` module).
//! - Small filesystem helpers shared by the above (`storage` module).
//!
//! Query engine integration lives in `scooter-trips-datafusion`; this crate
//! keeps DataFusion types out.
#![deny(missing_docs)]

pub mod ingest;
pub mod intervals;
pub mod metadata;
pub mod partition;
pub mod route;
pub mod storage;
pub mod trip;

pub use ingest::{IngestError, IngestOptions, IngestReport, ingest_file, ingest_files};
pub use intervals::IntervalSummary;
pub use metadata::{CorpusMetadata, MetadataError};
pub use partition::{PartitionError, PartitionKey, PartitionWriter};
pub use route::{ParsedRoute, PathSample, parse_route};
pub use trip::{Trip, TripError};
