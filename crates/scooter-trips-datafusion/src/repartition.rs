//! Flat dataset → Hive-partitioned dataset.
//!
//! The source is read once per calendar year. Each year's rows (non-empty
//! path, start inside the year) are streamed from DataFusion straight into a
//! [`PartitionWriter`], so at most one year of buffered row groups is held at
//! a time. Years are processed one after another; a failing year is logged
//! and recorded and the rest still run.

use std::path::Path;

use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int32Type};
use datafusion::functions::expr_fn::date_part;
use datafusion::logical_expr::{cast as cast_expr, col, lit};
use datafusion::prelude::SessionContext;
use futures::StreamExt;
use log::{info, warn};
use scooter_trips_core::partition::{PartitionReport, PartitionWriter, YEAR_KEY};
use scooter_trips_core::storage;
use scooter_trips_core::trip::START_TIMESTAMP;
use snafu::prelude::*;

use crate::dataset::{TRIPS_TABLE, register_flat, require_parquet};
use crate::error::{
    ArrowSnafu, DataFusionSnafu, EngineError, EngineResult, PartitionSnafu, StorageSnafu,
};
use crate::filters::{has_path, starts_in_year};
use crate::settings::{EngineSettings, session_context};

/// Options for [`repartition`].
#[derive(Debug, Clone, Default)]
pub struct RepartitionOptions {
    /// Years to write; `None` discovers them from the data.
    pub years: Option<Vec<i32>>,
    /// Engine resources.
    pub engine: EngineSettings,
}

/// Outcome of a repartition run.
#[derive(Debug, Default)]
pub struct RepartitionReport {
    /// Years that completed, with their counters, in processing order.
    pub years: Vec<(i32, PartitionReport)>,
    /// Years that failed, with the error that stopped them.
    pub failed_years: Vec<(i32, EngineError)>,
}

impl RepartitionReport {
    /// Counters summed over all completed years.
    pub fn totals(&self) -> PartitionReport {
        let mut totals = PartitionReport::default();
        for (_, report) in &self.years {
            totals.merge(report);
        }
        totals
    }
}

/// Distinct start years present in `table`, ascending.
pub async fn discover_years(ctx: &SessionContext, table: &str) -> EngineResult<Vec<i32>> {
    let year = cast_expr(
        date_part(lit("year"), col(START_TIMESTAMP)),
        DataType::Int32,
    )
    .alias(YEAR_KEY);

    let batches = ctx
        .table(table)
        .await
        .context(DataFusionSnafu)?
        .filter(col(START_TIMESTAMP).is_not_null())
        .context(DataFusionSnafu)?
        .aggregate(vec![year], vec![])
        .context(DataFusionSnafu)?
        .collect()
        .await
        .context(DataFusionSnafu)?;

    let mut years = Vec::new();
    for batch in &batches {
        let values = cast(batch.column(0), &DataType::Int32).context(ArrowSnafu)?;
        let values = values.as_primitive::<Int32Type>();
        years.extend((0..values.len()).filter(|&i| values.is_valid(i)).map(|i| values.value(i)));
    }
    years.sort_unstable();
    years.dedup();
    Ok(years)
}

async fn write_year(
    ctx: &SessionContext,
    year: i32,
    output: &Path,
    memory_limit: Option<usize>,
) -> EngineResult<PartitionReport> {
    let mut stream = ctx
        .table(TRIPS_TABLE)
        .await
        .context(DataFusionSnafu)?
        .filter(starts_in_year(year)?.and(has_path()))
        .context(DataFusionSnafu)?
        .execute_stream()
        .await
        .context(DataFusionSnafu)?;

    let mut writer = PartitionWriter::new(output).with_memory_limit(memory_limit);
    while let Some(batch) = stream.next().await {
        let batch = batch.context(DataFusionSnafu)?;
        writer.write(&batch).context(PartitionSnafu)?;
    }
    writer.finish().context(PartitionSnafu)
}

/// Rewrite the flat dataset under `source` as a partitioned dataset under
/// `output`.
///
/// Fails up front if `source` is missing or has no Parquet files. Cells that
/// already exist under `output` are left untouched.
pub async fn repartition(
    source: &Path,
    output: &Path,
    options: &RepartitionOptions,
) -> EngineResult<RepartitionReport> {
    require_parquet(source)?;
    storage::ensure_dir(output).context(StorageSnafu)?;

    let ctx = session_context(&options.engine)?;
    register_flat(&ctx, TRIPS_TABLE, source).await?;

    let years = match &options.years {
        Some(years) => years.clone(),
        None => discover_years(&ctx, TRIPS_TABLE).await?,
    };
    info!(
        "repartitioning {} into {} for years {years:?}",
        source.display(),
        output.display()
    );

    let mut report = RepartitionReport::default();
    for year in years {
        info!("processing year {year}");
        match write_year(&ctx, year, output, options.engine.memory_limit).await {
            Ok(year_report) => {
                info!(
                    "year {year}: {} rows in {} cells",
                    year_report.rows_written, year_report.cells_written
                );
                report.years.push((year, year_report));
            }
            Err(e) => {
                warn!("failed to repartition year {year}: {e}");
                report.failed_years.push((year, e));
            }
        }
    }

    Ok(report)
}
