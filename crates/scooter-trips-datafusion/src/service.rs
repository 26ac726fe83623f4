//! Read-only trip queries over a dataset directory.
//!
//! [`TripQueryService`] owns its configuration and a lazily opened
//! [`SessionContext`]. The context is created on the first query that finds
//! data; until then every query reports [`ServiceError::NoData`] and the next
//! one tries again, so a dataset produced after startup is picked up without
//! a restart. Once open, the session is shared by all callers.
//!
//! Consumers (the HTTP layer, the CLI) depend on the [`TripQueries`] trait so
//! they can be tested against a stub.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use datafusion::logical_expr::col;
use datafusion::prelude::SessionContext;
use log::{debug, warn};
use scooter_trips_core::metadata::{self, CorpusMetadata, iso8601};
use scooter_trips_core::partition::GRID_LAT_KEY;
use scooter_trips_core::route::PathSample;
use scooter_trips_core::trip::{self, END_TIMESTAMP, PATH, ROUTE_ID, START_TIMESTAMP};
use serde::Serialize;
use snafu::prelude::*;
use tokio::sync::OnceCell;

use crate::dataset::{TRIPS_TABLE, register_dataset};
use crate::error::{
    DataFusionSnafu, EngineError, EngineSnafu, InvalidQuerySnafu, ServiceError, ServiceResult,
    TripSnafu,
};
use crate::filters::{
    conjunction, ends_at_or_before, first_point_within, grid_cells_within, starts_at_or_after,
};
use crate::settings::{EngineSettings, session_context};
use crate::summary::summarize_table;

/// Sample size when the caller does not ask for one.
pub const DEFAULT_SAMPLE_LIMIT: usize = 5_000;
/// Hard cap on sample size.
pub const MAX_SAMPLE_LIMIT: usize = 50_000;

/// Configuration for [`TripQueryService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the dataset to query (flat or partitioned).
    pub dataset_root: PathBuf,
    /// Location of the precomputed summary.
    pub metadata_path: PathBuf,
    /// Sample size when none is requested.
    pub default_limit: usize,
    /// Largest sample size ever returned.
    pub max_limit: usize,
    /// Engine resources for the shared session.
    pub engine: EngineSettings,
}

impl ServiceConfig {
    /// Defaults for a dataset at `dataset_root`, with the metadata artifact
    /// at `<dataset_root>/metadata.json`.
    pub fn new(dataset_root: impl Into<PathBuf>) -> Self {
        let dataset_root = dataset_root.into();
        Self {
            metadata_path: metadata::metadata_path(&dataset_root),
            dataset_root,
            default_limit: DEFAULT_SAMPLE_LIMIT,
            max_limit: MAX_SAMPLE_LIMIT,
            engine: EngineSettings::default(),
        }
    }

    /// Effective number of rows for a requested `limit`.
    pub fn effective_limit(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

/// Inclusive geographic box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Northern latitude bound.
    pub north: f64,
    /// Southern latitude bound.
    pub south: f64,
    /// Eastern longitude bound.
    pub east: f64,
    /// Western longitude bound.
    pub west: f64,
}

impl BoundingBox {
    /// Validated box; edges must be finite with `south <= north` and
    /// `west <= east`.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> ServiceResult<Self> {
        ensure!(
            [north, south, east, west].iter().all(|v| v.is_finite()),
            InvalidQuerySnafu {
                message: "bounding box edges must be finite numbers",
            }
        );
        ensure!(
            south <= north,
            InvalidQuerySnafu {
                message: format!("south ({south}) must not exceed north ({north})"),
            }
        );
        ensure!(
            west <= east,
            InvalidQuerySnafu {
                message: format!("west ({west}) must not exceed east ({east})"),
            }
        );
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }

    /// Box from optional edges: all four or none.
    pub fn from_parts(
        north: Option<f64>,
        south: Option<f64>,
        east: Option<f64>,
        west: Option<f64>,
    ) -> ServiceResult<Option<Self>> {
        match (north, south, east, west) {
            (Some(n), Some(s), Some(e), Some(w)) => Self::new(n, s, e, w).map(Some),
            (None, None, None, None) => Ok(None),
            _ => InvalidQuerySnafu {
                message: "bounding box needs all of north, south, east and west",
            }
            .fail(),
        }
    }
}

/// Parameters of a sample query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleQuery {
    /// Rows requested; capped by the service.
    pub limit: Option<usize>,
    /// Keep trips starting at or after this instant.
    pub start: Option<NaiveDateTime>,
    /// Keep trips ending at or before this instant.
    pub end: Option<NaiveDateTime>,
    /// Keep trips whose first point lies in this box.
    pub bbox: Option<BoundingBox>,
}

/// One trip in a sample response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripSample {
    /// Source route identifier, if the export had one.
    pub route_id: Option<String>,
    /// Start instant, ISO-8601.
    pub start_timestamp: Option<String>,
    /// End instant, ISO-8601.
    pub end_timestamp: Option<String>,
    /// Ordered `[timestamp, lat, lon]` samples.
    pub path: Vec<PathSample>,
}

/// Parse a `start`/`end` query bound.
///
/// Accepts RFC 3339 (converted to UTC), `YYYY-MM-DD[ T]HH:MM:SS[.f]` and
/// bare dates (midnight).
pub fn parse_time_bound(text: &str) -> ServiceResult<NaiveDateTime> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context(InvalidQuerySnafu {
            message: format!("invalid timestamp '{text}'"),
        })
}

/// Queries the HTTP layer needs.
#[async_trait]
pub trait TripQueries: Send + Sync + 'static {
    /// Corpus summary.
    async fn stats(&self) -> ServiceResult<CorpusMetadata>;

    /// Up to `query.limit` trips matching the filters.
    async fn sample(&self, query: &SampleQuery) -> ServiceResult<Vec<TripSample>>;
}

/// DataFusion-backed [`TripQueries`].
pub struct TripQueryService {
    config: ServiceConfig,
    ctx: OnceCell<SessionContext>,
}

impl std::fmt::Debug for TripQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripQueryService")
            .field("config", &self.config)
            .field("opened", &self.ctx.initialized())
            .finish()
    }
}

impl TripQueryService {
    /// Create a service; nothing is opened until the first query.
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            ctx: OnceCell::new(),
        }
    }

    /// The service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn dataset_root(&self) -> &Path {
        &self.config.dataset_root
    }

    async fn open(&self) -> ServiceResult<SessionContext> {
        let ctx = session_context(&self.config.engine).context(EngineSnafu)?;
        match register_dataset(&ctx, TRIPS_TABLE, self.dataset_root()).await {
            Ok(layout) => {
                debug!(
                    "opened {} ({layout:?}) for queries",
                    self.dataset_root().display()
                );
                Ok(ctx)
            }
            Err(EngineError::DatasetMissing { .. } | EngineError::NoParquetFiles { .. }) => {
                Err(ServiceError::NoData)
            }
            Err(e) => Err(e).context(EngineSnafu),
        }
    }

    async fn context(&self) -> ServiceResult<&SessionContext> {
        self.ctx.get_or_try_init(|| self.open()).await
    }

    async fn live_stats(&self) -> ServiceResult<CorpusMetadata> {
        let ctx = self.context().await?;
        summarize_table(ctx, TRIPS_TABLE)
            .await
            .context(EngineSnafu)
    }

    async fn run_sample(
        &self,
        ctx: &SessionContext,
        query: &SampleQuery,
        limit: usize,
    ) -> Result<Vec<TripSample>, EngineError> {
        let df = ctx.table(TRIPS_TABLE).await.context(DataFusionSnafu)?;
        let has_column = |name: &str| df.schema().field_with_unqualified_name(name).is_ok();

        let mut filters = Vec::new();
        if let Some(start) = query.start {
            filters.push(starts_at_or_after(start));
        }
        if let Some(end) = query.end {
            filters.push(ends_at_or_before(end));
        }
        if let Some(b) = query.bbox {
            if has_column(GRID_LAT_KEY) {
                filters.push(grid_cells_within(b.north, b.south, b.east, b.west));
            }
            filters.push(first_point_within(b.north, b.south, b.east, b.west));
        }

        let projection: Vec<_> = [ROUTE_ID, START_TIMESTAMP, END_TIMESTAMP, PATH]
            .into_iter()
            .filter(|name| has_column(name))
            .map(|name| col(name))
            .collect();

        let mut df = df;
        if let Some(predicate) = conjunction(filters) {
            df = df.filter(predicate).context(DataFusionSnafu)?;
        }
        let batches = df
            .select(projection)
            .context(DataFusionSnafu)?
            .limit(0, Some(limit))
            .context(DataFusionSnafu)?
            .collect()
            .await
            .context(DataFusionSnafu)?;

        let mut out = Vec::with_capacity(limit);
        for batch in &batches {
            for t in trip::trips_from_batch(batch).context(TripSnafu)? {
                out.push(TripSample {
                    route_id: t.route_id,
                    start_timestamp: t.start_timestamp.map(iso8601),
                    end_timestamp: t.end_timestamp.map(iso8601),
                    path: t.path,
                });
            }
        }
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl TripQueries for TripQueryService {
    async fn stats(&self) -> ServiceResult<CorpusMetadata> {
        match metadata::read_metadata(&self.config.metadata_path).await {
            Ok(summary) => return Ok(summary),
            Err(e) if e.is_not_found() => {
                debug!("no metadata artifact, scanning {}", self.dataset_root().display());
            }
            Err(e) => warn!("ignoring unreadable metadata artifact: {e}"),
        }
        self.live_stats().await
    }

    async fn sample(&self, query: &SampleQuery) -> ServiceResult<Vec<TripSample>> {
        let ctx = self.context().await?;
        let limit = self.config.effective_limit(query.limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.run_sample(ctx, query, limit)
            .await
            .context(EngineSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_default_and_cap() {
        let mut config = ServiceConfig::new("/data");
        assert_eq!(config.metadata_path, PathBuf::from("/data/metadata.json"));
        assert_eq!(config.effective_limit(None), 5_000);
        assert_eq!(config.effective_limit(Some(10)), 10);
        assert_eq!(config.effective_limit(Some(1_000_000)), 50_000);

        config.max_limit = 3;
        assert_eq!(config.effective_limit(None), 3);
    }

    #[test]
    fn bounding_box_needs_all_edges_in_order() {
        assert!(matches!(
            BoundingBox::from_parts(Some(1.0), None, None, None),
            Err(ServiceError::InvalidQuery { .. })
        ));
        assert!(matches!(
            BoundingBox::new(47.0, 48.0, -122.0, -123.0),
            Err(ServiceError::InvalidQuery { .. })
        ));
        assert!(matches!(
            BoundingBox::new(48.0, 47.0, -123.0, -122.0),
            Err(ServiceError::InvalidQuery { .. })
        ));
        assert!(matches!(
            BoundingBox::new(f64::NAN, 47.0, -122.0, -123.0),
            Err(ServiceError::InvalidQuery { .. })
        ));
        assert_eq!(
            BoundingBox::from_parts(None, None, None, None).ok(),
            Some(None)
        );
        assert!(BoundingBox::from_parts(Some(48.0), Some(47.0), Some(-122.0), Some(-123.0))
            .is_ok_and(|b| b.is_some()));
    }

    #[test]
    fn time_bounds_accept_common_shapes() -> ServiceResult<()> {
        let expected = NaiveDate::from_ymd_opt(2023, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .ok_or(ServiceError::NoData)?;

        assert_eq!(parse_time_bound("2023-05-01T12:30:00")?, expected);
        assert_eq!(parse_time_bound("2023-05-01 12:30:00")?, expected);
        assert_eq!(parse_time_bound("2023-05-01T14:30:00+02:00")?, expected);
        assert_eq!(parse_time_bound("2023-05-01T12:30:00Z")?, expected);
        assert_eq!(
            parse_time_bound("2023-05-01")?,
            expected.date().and_hms_opt(0, 0, 0).ok_or(ServiceError::NoData)?
        );
        assert!(matches!(
            parse_time_bound("yesterday"),
            Err(ServiceError::InvalidQuery { .. })
        ));
        Ok(())
    }
}
