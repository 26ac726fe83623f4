//! Sampling intervals of a dataset's paths.

use std::path::Path;

use datafusion::logical_expr::col;
use log::info;
use scooter_trips_core::intervals::IntervalSummary;
use scooter_trips_core::trip::{self, PATH};
use snafu::prelude::*;

use crate::dataset::{TRIPS_TABLE, register_dataset};
use crate::error::{DataFusionSnafu, EngineError, EngineResult, TripSnafu};
use crate::settings::{EngineSettings, session_context};

/// Trips read when no count is given.
pub const DEFAULT_INTERVAL_TRIPS: usize = 100;

/// Summarize the active sampling intervals of the first `trips` trips under
/// `root`.
///
/// `Ok(None)` means there was nothing to measure: no Parquet files, or no
/// path with two samples less than a minute apart. A missing `root` is an
/// error.
pub async fn sample_intervals(
    root: &Path,
    trips: usize,
    settings: &EngineSettings,
) -> EngineResult<Option<IntervalSummary>> {
    let ctx = session_context(settings)?;
    match register_dataset(&ctx, TRIPS_TABLE, root).await {
        Ok(_) => {}
        Err(EngineError::NoParquetFiles { .. }) => return Ok(None),
        Err(e) => return Err(e),
    }

    let batches = ctx
        .table(TRIPS_TABLE)
        .await
        .context(DataFusionSnafu)?
        .select(vec![col(PATH)])
        .context(DataFusionSnafu)?
        .limit(0, Some(trips))
        .context(DataFusionSnafu)?
        .collect()
        .await
        .context(DataFusionSnafu)?;

    let mut paths = Vec::new();
    for batch in &batches {
        paths.extend(trip::paths_from_array(batch.column(0).as_ref()).context(TripSnafu)?);
    }

    let summary = IntervalSummary::from_paths(paths.iter().map(Vec::as_slice));
    info!(
        "measured {} intervals across {} trips under {}",
        summary.as_ref().map_or(0, |s| s.intervals),
        paths.len(),
        root.display()
    );
    Ok(summary)
}
