#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use scooter_trips_core::PathSample;
use scooter_trips_core::route::epoch_seconds;
use scooter_trips_core::trip::{Trip, trips_from_batch, trips_to_batch};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|d| d.and_hms_opt(h, 0, 0))
        .expect("valid test timestamp")
}

/// A ten-minute trip starting at `start` whose first point is `(lat, lon)`.
pub fn trip(id: &str, start: NaiveDateTime, lat: f64, lon: f64) -> Trip {
    let end = start + chrono::Duration::minutes(10);
    Trip {
        route_id: Some(id.to_string()),
        user_id: Some(format!("user-{id}")),
        model: Some("S1".to_string()),
        travel_time: Some(600.0),
        distance: Some(1.5),
        start_timestamp: Some(start),
        end_timestamp: Some(end),
        path: vec![
            PathSample::new(epoch_seconds(start), lat, lon),
            PathSample::new(epoch_seconds(end), lat + 0.001, lon + 0.001),
        ],
    }
}

/// Five trips over two years and three grid cells.
pub fn five_trips() -> Vec<Trip> {
    vec![
        trip("a", ts(2023, 5, 1, 8), 47.61, -122.35),
        trip("b", ts(2023, 5, 2, 9), 47.69, -122.31),
        trip("c", ts(2023, 6, 15, 18), 47.55, -122.25),
        trip("d", ts(2024, 1, 3, 7), 47.61, -122.35),
        trip("e", ts(2024, 2, 28, 23), -33.87, 151.21),
    ]
}

/// Write `trips` as one flat Parquet chunk under `dir`.
pub fn write_flat(dir: &Path, name: &str, trips: &[Trip]) -> TestResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let batch = trips_to_batch(trips)?;
    let mut writer = ArrowWriter::try_new(File::create(&path)?, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(path)
}

pub fn read_trips(path: &Path) -> TestResult<Vec<Trip>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        out.extend(trips_from_batch(&batch?)?);
    }
    Ok(out)
}

/// Every `*.parquet` file under `root`, sorted.
pub fn parquet_files(root: &Path) -> TestResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == "parquet") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}
