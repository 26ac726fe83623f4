#![allow(missing_docs)]

mod common;

use common::{TestResult, five_trips, trip, ts, write_flat};
use scooter_trips_core::CorpusMetadata;
use scooter_trips_core::metadata::write_metadata;
use scooter_trips_datafusion::service::parse_time_bound;
use scooter_trips_datafusion::{
    BoundingBox, RepartitionOptions, SampleQuery, ServiceConfig, ServiceError, TripQueries,
    TripQueryService, repartition,
};
use tempfile::TempDir;

async fn partitioned(tmp: &TempDir, trips: &[scooter_trips_core::Trip]) -> TestResult<TripQueryService> {
    let flat = tmp.path().join("flat");
    let hive = tmp.path().join("hive");
    write_flat(&flat, "trips_chunk_0000.parquet", trips)?;
    repartition(&flat, &hive, &RepartitionOptions::default()).await?;
    Ok(TripQueryService::new(ServiceConfig::new(hive)))
}

fn ids(samples: &[scooter_trips_datafusion::TripSample]) -> Vec<String> {
    let mut ids: Vec<String> = samples
        .iter()
        .filter_map(|s| s.route_id.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn no_dataset_means_no_data() -> TestResult {
    let tmp = TempDir::new()?;
    let service = TripQueryService::new(ServiceConfig::new(tmp.path().join("missing")));

    assert!(matches!(service.stats().await, Err(ServiceError::NoData)));
    assert!(matches!(
        service.sample(&SampleQuery::default()).await,
        Err(ServiceError::NoData)
    ));
    Ok(())
}

#[tokio::test]
async fn data_written_after_startup_is_picked_up() -> TestResult {
    let tmp = TempDir::new()?;
    let flat = tmp.path().join("flat");
    let service = TripQueryService::new(ServiceConfig::new(&flat));

    assert!(matches!(service.stats().await, Err(ServiceError::NoData)));

    write_flat(&flat, "trips_chunk_0000.parquet", &five_trips())?;
    let stats = service.stats().await?;
    assert_eq!(stats.total_records, 5);
    Ok(())
}

#[tokio::test]
async fn limit_caps_the_sample() -> TestResult {
    let tmp = TempDir::new()?;
    let service = partitioned(&tmp, &five_trips()).await?;

    let two = service
        .sample(&SampleQuery {
            limit: Some(2),
            ..SampleQuery::default()
        })
        .await?;
    assert_eq!(two.len(), 2);

    let none = service
        .sample(&SampleQuery {
            limit: Some(0),
            ..SampleQuery::default()
        })
        .await?;
    assert!(none.is_empty());

    let all = service.sample(&SampleQuery::default()).await?;
    assert_eq!(ids(&all), vec!["a", "b", "c", "d", "e"]);
    Ok(())
}

#[tokio::test]
async fn max_limit_is_a_hard_cap() -> TestResult {
    let tmp = TempDir::new()?;
    let flat = tmp.path().join("flat");
    write_flat(&flat, "trips_chunk_0000.parquet", &five_trips())?;
    let mut config = ServiceConfig::new(&flat);
    config.max_limit = 3;
    let service = TripQueryService::new(config);

    let sample = service
        .sample(&SampleQuery {
            limit: Some(100),
            ..SampleQuery::default()
        })
        .await?;
    assert_eq!(sample.len(), 3);
    Ok(())
}

#[tokio::test]
async fn bbox_uses_the_exact_first_point_not_just_the_cell() -> TestResult {
    let tmp = TempDir::new()?;
    // Both trips start in cell grid_lat=476 / grid_lon=-1224.
    let inside = trip("inside", ts(2023, 5, 1, 8), 47.61, -122.35);
    let outside = trip("outside", ts(2023, 5, 1, 9), 47.69, -122.31);
    let elsewhere = trip("elsewhere", ts(2023, 5, 1, 10), -33.87, 151.21);
    let service = partitioned(&tmp, &[inside, outside, elsewhere]).await?;

    let bbox = BoundingBox::new(47.65, 47.60, -122.30, -122.40)?;
    let sample = service
        .sample(&SampleQuery {
            bbox: Some(bbox),
            ..SampleQuery::default()
        })
        .await?;
    assert_eq!(ids(&sample), vec!["inside"]);

    let first = sample[0].path.first().ok_or("empty path")?;
    assert_eq!((first.latitude, first.longitude), (47.61, -122.35));
    Ok(())
}

#[tokio::test]
async fn time_window_filters_start_and_end() -> TestResult {
    let tmp = TempDir::new()?;
    let service = partitioned(&tmp, &five_trips()).await?;

    let sample = service
        .sample(&SampleQuery {
            start: Some(parse_time_bound("2023-05-02")?),
            end: Some(parse_time_bound("2024-01-03T07:10:00")?),
            ..SampleQuery::default()
        })
        .await?;
    assert_eq!(ids(&sample), vec!["b", "c", "d"]);

    let d = sample
        .iter()
        .find(|s| s.route_id.as_deref() == Some("d"))
        .ok_or("d missing")?;
    assert_eq!(d.start_timestamp.as_deref(), Some("2024-01-03T07:00:00"));
    assert_eq!(d.end_timestamp.as_deref(), Some("2024-01-03T07:10:00"));
    Ok(())
}

#[tokio::test]
async fn stats_prefer_the_metadata_artifact() -> TestResult {
    let tmp = TempDir::new()?;
    let service = partitioned(&tmp, &five_trips()).await?;

    let live = service.stats().await?;
    assert_eq!(live.total_records, 5);
    assert_eq!(live.start_date.as_deref(), Some("2023-05-01T08:00:00"));
    assert_eq!(live.generated_at, None);

    let artifact = CorpusMetadata {
        total_records: 42,
        start_date: Some("2020-01-01T00:00:00".to_string()),
        end_date: None,
        generated_at: Some(1.5),
    };
    write_metadata(&service.config().metadata_path, &artifact).await?;
    assert_eq!(service.stats().await?, artifact);

    // A corrupt artifact falls back to the live scan.
    std::fs::write(&service.config().metadata_path, b"{")?;
    assert_eq!(service.stats().await?.total_records, 5);
    Ok(())
}
