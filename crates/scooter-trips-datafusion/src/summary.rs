//! Corpus summary: row count and time range in one scan.

use std::path::Path;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int64Type};
use chrono::NaiveDateTime;
use datafusion::functions_aggregate::expr_fn::{count, max, min};
use datafusion::logical_expr::{col, lit};
use datafusion::prelude::SessionContext;
use log::info;
use scooter_trips_core::metadata::{self, CorpusMetadata};
use scooter_trips_core::trip::{self, END_TIMESTAMP, START_TIMESTAMP, TripError};
use snafu::prelude::*;

use crate::dataset::{TRIPS_TABLE, register_dataset};
use crate::error::{
    ArrowSnafu, DataFusionSnafu, DatasetMissingSnafu, EngineError, EngineResult, MetadataSnafu,
    TripSnafu,
};
use crate::settings::{EngineSettings, session_context};

const TOTAL: &str = "total_records";
const FIRST_START: &str = "first_start";
const LAST_END: &str = "last_end";

/// Summarize the table registered as `table` in `ctx`.
pub async fn summarize_table(ctx: &SessionContext, table: &str) -> EngineResult<CorpusMetadata> {
    let batches = ctx
        .table(table)
        .await
        .context(DataFusionSnafu)?
        .aggregate(
            vec![],
            vec![
                count(lit(1)).alias(TOTAL),
                min(col(START_TIMESTAMP)).alias(FIRST_START),
                max(col(END_TIMESTAMP)).alias(LAST_END),
            ],
        )
        .context(DataFusionSnafu)?
        .collect()
        .await
        .context(DataFusionSnafu)?;

    let Some(batch) = batches.iter().find(|b| b.num_rows() > 0) else {
        return Ok(CorpusMetadata::empty());
    };

    let total = cast(column(batch, TOTAL)?, &DataType::Int64).context(ArrowSnafu)?;
    let total = total.as_primitive::<Int64Type>();
    let total = if total.is_null(0) { 0 } else { total.value(0).max(0) as u64 };

    Ok(CorpusMetadata::new(
        total,
        first_timestamp(batch, FIRST_START)?,
        first_timestamp(batch, LAST_END)?,
    ))
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> EngineResult<&'a arrow::array::ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| TripError::MissingColumn {
            column: name.to_string(),
        })
        .context(TripSnafu)
}

fn first_timestamp(batch: &RecordBatch, name: &str) -> EngineResult<Option<NaiveDateTime>> {
    let values = trip::timestamps_micros(name, column(batch, name)?).context(TripSnafu)?;
    if values.is_null(0) {
        return Ok(None);
    }
    Ok(trip::naive_from_micros(values.value(0)))
}

/// Summarize the dataset under `root` with a fresh session.
///
/// A root without Parquet files summarizes as empty; a missing root is an
/// error.
pub async fn summarize(root: &Path, settings: &EngineSettings) -> EngineResult<CorpusMetadata> {
    let ctx = session_context(settings)?;
    match register_dataset(&ctx, TRIPS_TABLE, root).await {
        Ok(_) => summarize_table(&ctx, TRIPS_TABLE).await,
        Err(EngineError::NoParquetFiles { .. }) => Ok(CorpusMetadata::empty()),
        Err(e) => Err(e),
    }
}

/// Summarize `root` and persist the result at `output`
/// (default `<root>/metadata.json`).
///
/// Nothing is written when `root` does not exist.
pub async fn generate_metadata(
    root: &Path,
    output: Option<&Path>,
    settings: &EngineSettings,
) -> EngineResult<CorpusMetadata> {
    ensure!(
        root.is_dir(),
        DatasetMissingSnafu {
            path: root.display().to_string(),
        }
    );

    let summary = summarize(root, settings).await?.stamped();
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| metadata::metadata_path(root));
    metadata::write_metadata(&path, &summary)
        .await
        .context(MetadataSnafu)?;

    info!(
        "wrote metadata for {} trips to {}",
        summary.total_records,
        path.display()
    );
    Ok(summary)
}
