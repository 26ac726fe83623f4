//! HTTP surface.
//!
//! - `GET /api/stats` returns the corpus summary.
//! - `GET /api/sample?limit&start&end&north&south&east&west` returns trips.
//! - Anything else is served from the optional static directory.
//!
//! Errors are JSON objects `{"error": "..."}`: 400 for bad parameters, 503
//! while no dataset exists, 500 (logged) for everything else.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use log::{error, info, warn};
use scooter_trips_core::CorpusMetadata;
use scooter_trips_datafusion::service::parse_time_bound;
use scooter_trips_datafusion::{BoundingBox, SampleQuery, ServiceError, TripQueries, TripSample};
use serde::Deserialize;
use snafu::ResultExt;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::error::{BindSnafu, CliResult, ServeSnafu};

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub static_dir: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    queries: Arc<dyn TripQueries>,
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Stats,
    Sample,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_service(endpoint: Endpoint, err: ServiceError) -> Self {
        match err {
            ServiceError::NoData => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: match endpoint {
                    Endpoint::Stats => "No data available yet",
                    Endpoint::Sample => "No data available",
                }
                .to_string(),
            },
            ServiceError::InvalidQuery { message } => Self::bad_request(message),
            other => {
                error!("{endpoint:?} query failed: {other}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Raw sample parameters; parsed by hand so failures become JSON 400s.
#[derive(Debug, Default, Deserialize)]
struct SampleParams {
    limit: Option<String>,
    start: Option<String>,
    end: Option<String>,
    north: Option<String>,
    south: Option<String>,
    east: Option<String>,
    west: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_coordinate(name: &str, value: &Option<String>) -> Result<Option<f64>, ApiError> {
    non_empty(value)
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| ApiError::bad_request(format!("invalid {name} '{v}'")))
        })
        .transpose()
}

impl SampleParams {
    fn into_query(self) -> Result<SampleQuery, ApiError> {
        let limit = non_empty(&self.limit)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| ApiError::bad_request(format!("invalid limit '{v}'")))
            })
            .transpose()?;

        let bound = |value: &Option<String>| {
            non_empty(value)
                .map(parse_time_bound)
                .transpose()
                .map_err(|e| ApiError::from_service(Endpoint::Sample, e))
        };
        let start = bound(&self.start)?;
        let end = bound(&self.end)?;

        let bbox = BoundingBox::from_parts(
            parse_coordinate("north", &self.north)?,
            parse_coordinate("south", &self.south)?,
            parse_coordinate("east", &self.east)?,
            parse_coordinate("west", &self.west)?,
        )
        .map_err(|e| ApiError::from_service(Endpoint::Sample, e))?;

        Ok(SampleQuery {
            limit,
            start,
            end,
            bbox,
        })
    }
}

async fn stats(State(state): State<AppState>) -> Result<Json<CorpusMetadata>, ApiError> {
    state
        .queries
        .stats()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(Endpoint::Stats, e))
}

async fn sample(
    State(state): State<AppState>,
    Query(params): Query<SampleParams>,
) -> Result<Json<Vec<TripSample>>, ApiError> {
    let query = params.into_query()?;
    state
        .queries
        .sample(&query)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(Endpoint::Sample, e))
}

/// Build the application router.
pub fn router(queries: Arc<dyn TripQueries>, static_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/api/stats", get(stats))
        .route("/api/sample", get(sample))
        .with_state(AppState { queries });

    let app = match static_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };
    app.layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: ServerConfig, queries: Arc<dyn TripQueries>) -> CliResult<()> {
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .context(BindSnafu { addr: config.bind })?;

    info!("listening on http://{}", config.bind);
    if let Some(dir) = &config.static_dir {
        info!("serving static files from {}", dir.display());
    }

    axum::serve(listener, router(queries, config.static_dir))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use scooter_trips_core::PathSample;
    use scooter_trips_datafusion::{ServiceConfig, ServiceResult, TripQueryService};
    use std::sync::Mutex;
    use tower::ServiceExt;

    type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

    /// Five fixed trips; records the last query it saw.
    #[derive(Default)]
    struct FixedTrips {
        last_query: Mutex<Option<SampleQuery>>,
    }

    fn sample_trip(i: usize) -> TripSample {
        TripSample {
            route_id: Some(format!("r{i}")),
            start_timestamp: Some("2023-05-01T00:00:17.660000".to_string()),
            end_timestamp: Some("2023-05-01T00:03:17".to_string()),
            path: vec![PathSample::new(1682899217.66, 47.6, -122.3)],
        }
    }

    #[async_trait]
    impl TripQueries for FixedTrips {
        async fn stats(&self) -> ServiceResult<CorpusMetadata> {
            Ok(CorpusMetadata {
                total_records: 5,
                start_date: Some("2023-05-01T00:00:17.660000".to_string()),
                end_date: Some("2023-05-31T23:00:00".to_string()),
                generated_at: None,
            })
        }

        async fn sample(&self, query: &SampleQuery) -> ServiceResult<Vec<TripSample>> {
            if let Ok(mut last) = self.last_query.lock() {
                *last = Some(query.clone());
            }
            let limit = query.limit.unwrap_or(5_000).min(5);
            Ok((0..limit).map(sample_trip).collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl TripQueries for Broken {
        async fn stats(&self) -> ServiceResult<CorpusMetadata> {
            Err(ServiceError::Engine {
                source: scooter_trips_datafusion::EngineError::InvalidYear { year: 0 },
            })
        }

        async fn sample(&self, _query: &SampleQuery) -> ServiceResult<Vec<TripSample>> {
            Err(ServiceError::NoData)
        }
    }

    async fn get_json(app: Router, uri: &str) -> TestResult<(StatusCode, serde_json::Value)> {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, serde_json::from_slice(&bytes)?))
    }

    #[tokio::test]
    async fn stats_without_dataset_is_503() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let service = TripQueryService::new(ServiceConfig::new(tmp.path().join("data")));
        let app = router(Arc::new(service), None);

        let (status, body) = get_json(app.clone(), "/api/stats").await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, serde_json::json!({"error": "No data available yet"}));

        let (status, body) = get_json(app, "/api/sample").await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, serde_json::json!({"error": "No data available"}));
        Ok(())
    }

    #[tokio::test]
    async fn sample_honours_limit() -> TestResult {
        let app = router(Arc::new(FixedTrips::default()), None);
        let (status, body) = get_json(app, "/api/sample?limit=2").await?;
        assert_eq!(status, StatusCode::OK);
        let trips = body.as_array().ok_or("not an array")?;
        assert_eq!(trips.len(), 2);
        assert_eq!(
            trips[0]["path"],
            serde_json::json!([[1682899217.66, 47.6, -122.3]])
        );
        Ok(())
    }

    #[tokio::test]
    async fn sample_parses_filters() -> TestResult {
        let queries = Arc::new(FixedTrips::default());
        let app = router(queries.clone(), None);
        let uri = "/api/sample?start=2023-05-01&end=2023-05-02T00:00:00Z\
                   &north=47.7&south=47.5&east=-122.2&west=-122.4";
        let (status, _) = get_json(app, uri).await?;
        assert_eq!(status, StatusCode::OK);

        let seen = queries
            .last_query
            .lock()
            .map_err(|_| "poisoned")?
            .clone()
            .ok_or("no query recorded")?;
        assert_eq!(seen.limit, None);
        assert_eq!(seen.start, Some(parse_time_bound("2023-05-01")?));
        assert_eq!(seen.end, Some(parse_time_bound("2023-05-02")?));
        assert_eq!(seen.bbox, Some(BoundingBox::new(47.7, 47.5, -122.2, -122.4)?));
        Ok(())
    }

    #[tokio::test]
    async fn bad_parameters_are_400() -> TestResult {
        let app = router(Arc::new(FixedTrips::default()), None);
        for uri in [
            "/api/sample?limit=-1",
            "/api/sample?limit=many",
            "/api/sample?start=not-a-date",
            "/api/sample?north=47.7",
            "/api/sample?north=47.5&south=47.7&east=-122.2&west=-122.4",
            "/api/sample?north=x&south=47.7&east=-122.2&west=-122.4",
        ] {
            let (status, body) = get_json(app.clone(), uri).await?;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn engine_failures_are_500_json() -> TestResult {
        let app = router(Arc::new(Broken), None);
        let (status, body) = get_json(app, "/api/stats").await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Year 0 is out of range");
        Ok(())
    }

    #[tokio::test]
    async fn static_files_are_served_at_root() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        std::fs::write(tmp.path().join("index.html"), "<h1>trips</h1>")?;
        let app = router(Arc::new(FixedTrips::default()), Some(tmp.path().to_path_buf()));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await?.to_bytes();
        assert_eq!(&bytes[..], b"<h1>trips</h1>");
        Ok(())
    }
}
