//! DataFusion integration for `scooter-trips-core`.
//!
//! This crate keeps all DataFusion types out of `scooter-trips-core`. It
//! provides:
//!
//! - session construction from [`EngineSettings`] (`settings`),
//! - registration of flat and partitioned datasets (`dataset`),
//! - the per-year repartition driver (`repartition`),
//! - the corpus summarizer that produces `metadata.json` (`summary`),
//! - sampling-interval analysis of stored paths (`intervals`),
//! - the read-only [`TripQueryService`] behind the [`TripQueries`] trait
//!   (`service`).
#![deny(missing_docs)]

pub mod dataset;
pub mod error;
pub mod filters;
pub mod intervals;
pub mod repartition;
pub mod service;
pub mod settings;
pub mod summary;

pub use error::{EngineError, EngineResult, ServiceError, ServiceResult};
pub use intervals::sample_intervals;
pub use repartition::{RepartitionOptions, RepartitionReport, repartition};
pub use service::{
    BoundingBox, SampleQuery, ServiceConfig, TripQueries, TripQueryService, TripSample,
};
pub use settings::EngineSettings;
pub use summary::{generate_metadata, summarize};
