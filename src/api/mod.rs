use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ReportConfig;
use crate::health::bind_address;
use crate::ingest::{IngestError, Ingestor, ReportEventRequest};
use crate::rollup::{AggregateRecord, Dimension, Granularity, RollupError, SeriesService};
use crate::store::{EventStore, EventWriter};

/// Errors returned by the HTTP handlers, rendered as `{"error": ...}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("window of {days} days exceeds the maximum of {max}")]
    WindowTooLong { days: i64, max: u32 },

    #[error(transparent)]
    Rollup(#[from] RollupError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let client = match self {
            Self::BadRequest(_) | Self::WindowTooLong { .. } => true,
            Self::Rollup(e) => e.is_client_error(),
            Self::Ingest(e) => e.is_client_error(),
        };

        if client {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.chain(), "request failed");
        }

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl ApiError {
    /// Joins the error and its sources into one line for logging.
    fn chain(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(e) = source {
            parts.push(e.to_string());
            source = e.source();
        }
        parts.join(": ")
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Shared handler state.
pub struct ApiState<S> {
    series: SeriesService<S>,
    ingestor: Ingestor<S>,
    report: ReportConfig,
}

impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            series: self.series.clone(),
            ingestor: self.ingestor.clone(),
            report: self.report.clone(),
        }
    }
}

impl<S> ApiState<S> {
    pub fn new(series: SeriesService<S>, ingestor: Ingestor<S>, report: ReportConfig) -> Self {
        Self {
            series,
            ingestor,
            report,
        }
    }

    /// Resolves the requested window length against the configured default
    /// and maximum.
    fn window_days(&self, days: Option<i64>) -> Result<u32, ApiError> {
        let days = days.unwrap_or(i64::from(self.report.window_days));

        if days < 1 {
            return Err(RollupError::InvalidWindow { days }.into());
        }

        if days > i64::from(self.report.max_window_days) {
            return Err(ApiError::WindowTooLong {
                days,
                max: self.report.max_window_days,
            });
        }

        u32::try_from(days).map_err(|_| ApiError::WindowTooLong {
            days,
            max: self.report.max_window_days,
        })
    }
}

/// Builds the API router.
pub fn router<S>(state: ApiState<S>) -> Router
where
    S: EventStore + EventWriter + 'static,
{
    Router::new()
        .route("/api/events/report", post(report_event::<S>))
        .route("/api/stats", get(stats::<S>))
        .route("/api/stats/breakdown", get(breakdown::<S>))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

/// POST /api/events/report
async fn report_event<S>(
    State(state): State<ApiState<S>>,
    payload: Result<Json<ReportEventRequest>, JsonRejection>,
) -> Result<Json<StatusBody>, ApiError>
where
    S: EventStore + EventWriter + 'static,
{
    let Json(request) = payload?;
    state.ingestor.report(request).await?;

    Ok(Json(StatusBody { status: "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    days: Option<i64>,
    granularity: Option<String>,
}

/// GET /api/stats
async fn stats<S>(
    State(state): State<ApiState<S>>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<Vec<AggregateRecord>>, ApiError>
where
    S: EventStore + EventWriter + 'static,
{
    let Query(query) = query?;

    let days = state.window_days(query.days)?;
    let granularity = match query.granularity.as_deref() {
        Some(name) => Granularity::from_name(name)?,
        None => Granularity::default(),
    };

    let series = state.series.get_series(days, granularity).await?;

    Ok(Json(series))
}

#[derive(Debug, Default, Deserialize)]
struct BreakdownQuery {
    dimension: Option<String>,
    days: Option<i64>,
    top: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryCount {
    pub category: String,
    pub count: u64,
}

/// GET /api/stats/breakdown
async fn breakdown<S>(
    State(state): State<ApiState<S>>,
    query: Result<Query<BreakdownQuery>, QueryRejection>,
) -> Result<Json<Vec<CategoryCount>>, ApiError>
where
    S: EventStore + EventWriter + 'static,
{
    let Query(query) = query?;

    let dimension = query
        .dimension
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("dimension is required".to_string()))
        .and_then(|name| Dimension::from_name(name).map_err(ApiError::from))?;
    let days = state.window_days(query.days)?;
    let top = query.top.unwrap_or(state.report.region_top_n);

    let entries = state.series.breakdown_top_n(days, dimension, top).await?;

    Ok(Json(
        entries
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect(),
    ))
}

/// Serves the API router until stopped.
pub struct ApiServer {
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves `app` in the background. Returns the
    /// bound address.
    pub async fn start(&self, app: Router) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "API server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting connections and drains in-flight requests.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}
