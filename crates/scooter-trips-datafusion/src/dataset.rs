//! Registering trip datasets with a session.
//!
//! Two on-disk layouts exist:
//!
//! - **flat**: the directory ingestion writes, one Parquet file per batch.
//! - **partitioned**: the Hive tree the repartitioner writes. The partition
//!   values are exposed as the Int32 columns `year`, `month`, `grid_lat` and
//!   `grid_lon` so filters on them prune whole directories.

use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::DataType;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::ListingOptions;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use log::debug;
use scooter_trips_core::partition::{GRID_LAT_KEY, GRID_LON_KEY, MONTH_KEY, YEAR_KEY};
use scooter_trips_core::storage::{self, PARQUET_EXTENSION};
use snafu::prelude::*;

use crate::error::{
    DataFusionSnafu, DatasetMissingSnafu, EngineResult, NoParquetFilesSnafu, StorageSnafu,
};

/// Name under which the trips dataset is registered.
pub const TRIPS_TABLE: &str = "trips";

/// Physical layout of a dataset directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLayout {
    /// Parquet files directly under the root.
    Flat,
    /// `year=/month=/grid_lat=/grid_lon=` directories under the root.
    Partitioned,
}

/// Partition columns of the partitioned layout, outermost first.
pub fn partition_columns() -> Vec<(String, DataType)> {
    [YEAR_KEY, MONTH_KEY, GRID_LAT_KEY, GRID_LON_KEY]
        .into_iter()
        .map(|name| (name.to_string(), DataType::Int32))
        .collect()
}

/// Directory path as a table URL; listing tables need the trailing slash.
pub fn dir_url(root: &Path) -> String {
    let mut url = root.display().to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Check that `root` exists and holds at least one Parquet file.
///
/// Fails with [`EngineError::DatasetMissing`](crate::EngineError::DatasetMissing)
/// if the directory does not exist and with
/// [`EngineError::NoParquetFiles`](crate::EngineError::NoParquetFiles) if it
/// holds no Parquet data.
pub fn require_parquet(root: &Path) -> EngineResult<()> {
    match storage::contains_parquet(root) {
        Ok(true) => Ok(()),
        Ok(false) => NoParquetFilesSnafu {
            path: root.display().to_string(),
        }
        .fail(),
        Err(e) if e.is_not_found() => DatasetMissingSnafu {
            path: root.display().to_string(),
        }
        .fail(),
        Err(e) => Err(e).context(StorageSnafu),
    }
}

/// Inspect `root` and decide which layout it holds.
pub fn detect_layout(root: &Path) -> EngineResult<DatasetLayout> {
    require_parquet(root)?;

    let year_prefix = format!("{YEAR_KEY}=");
    let entries = std::fs::read_dir(root)
        .map_err(|e| storage::StorageError::OtherIo {
            path: root.display().to_string(),
            source: e,
            backtrace: snafu::Backtrace::capture(),
        })
        .context(StorageSnafu)?;

    let partitioned = entries.filter_map(Result::ok).any(|entry| {
        entry.file_type().is_ok_and(|t| t.is_dir())
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&year_prefix))
    });

    Ok(if partitioned {
        DatasetLayout::Partitioned
    } else {
        DatasetLayout::Flat
    })
}

/// Register the flat dataset under `root` as `name`.
pub async fn register_flat(ctx: &SessionContext, name: &str, root: &Path) -> EngineResult<()> {
    let options = ParquetReadOptions::default().file_extension(".parquet");
    ctx.register_parquet(name, dir_url(root), options)
        .await
        .context(DataFusionSnafu)
}

/// Register the partitioned dataset under `root` as `name`.
pub async fn register_partitioned(
    ctx: &SessionContext,
    name: &str,
    root: &Path,
) -> EngineResult<()> {
    let parquet_options = ctx.state().table_options().parquet.clone();
    let format = ParquetFormat::default().with_options(parquet_options);
    let options = ListingOptions::new(Arc::new(format))
        .with_file_extension(format!(".{PARQUET_EXTENSION}"))
        .with_table_partition_cols(partition_columns());

    ctx.register_listing_table(name, dir_url(root), options, None, None)
        .await
        .context(DataFusionSnafu)
}

/// Detect the layout of `root` and register it as `name`.
pub async fn register_dataset(
    ctx: &SessionContext,
    name: &str,
    root: &Path,
) -> EngineResult<DatasetLayout> {
    let layout = detect_layout(root)?;
    debug!("registering {} as {name} ({layout:?})", root.display());
    match layout {
        DatasetLayout::Flat => register_flat(ctx, name, root).await?,
        DatasetLayout::Partitioned => register_partitioned(ctx, name, root).await?,
    }
    Ok(layout)
}
