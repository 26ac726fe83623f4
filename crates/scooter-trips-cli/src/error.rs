use std::net::SocketAddr;

use scooter_trips_core::IngestError;
use scooter_trips_datafusion::{EngineError, ServiceError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("No CSV files found under {path}"))]
    NoCsvInputs { path: String },

    #[snafu(display("Ingestion failed: {source}"))]
    Ingest { source: IngestError },

    #[snafu(display("All {count} input files failed to ingest"))]
    AllInputsFailed { count: usize },

    #[snafu(display("Ingestion worker stopped unexpectedly: {source}"))]
    IngestTask { source: tokio::task::JoinError },

    #[snafu(display("{source}"))]
    Engine { source: EngineError },

    #[snafu(display("All {count} years failed to repartition"))]
    AllYearsFailed { count: usize },

    #[snafu(display("{source}"))]
    Query { source: ServiceError },

    #[snafu(display(
        "Invalid --memory-limit '{value}'. \
         Use a byte count or a size such as 512MB or 4GiB."
    ))]
    InvalidMemoryLimit { value: String },

    #[snafu(display("Failed to encode output as JSON: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("HTTP server error: {source}"))]
    Serve { source: std::io::Error },
}
