//! HTTP surface for the display layer
//!
//! Read-only views of the latest snapshot plus the pause toggle.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kline_types::candle::Candle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::ConnectionState;
use crate::engine::{Clock, EngineView, SystemClock};
use crate::view::{chart_window, percent_change_points, price_points, PricePoint, RangeSelection};

/// Widest chart window served.
pub const MAX_CHART_LIMIT: usize = 1440;
const DEFAULT_CHART_LIMIT: usize = 60;

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

/// Shared state for the handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineView,
    pub clock: Arc<dyn Clock>,
}

impl ApiState {
    pub fn new(engine: EngineView) -> Self {
        Self {
            engine,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub fn create_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/series", get(get_series))
        .route("/chart", get(get_chart))
        .route("/status", get(get_status))
        .route("/pause", post(set_pause));

    Router::new()
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub minutes: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse {
    pub version: u64,
    pub connected: bool,
    /// `[start, end]` of the selection, absent for the full series.
    pub domain: Option<(i64, i64)>,
    pub candles: Vec<Candle>,
    pub prices: Vec<PricePoint>,
    pub percent_change: Vec<PricePoint>,
}

async fn get_series(
    State(state): State<ApiState>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let selection = match query.minutes {
        None => RangeSelection::All,
        Some(0) => return Err(ApiError::BadRequest("minutes must be greater than zero".to_string())),
        Some(n) => RangeSelection::LastMinutes(n),
    };

    let now = state.clock.now_ms();
    let snapshot = state.engine.series();
    let selected = selection.select(&snapshot.candles, now);

    Ok(Json(SeriesResponse {
        version: snapshot.version,
        connected: state.engine.is_connected(),
        domain: selection.domain(now),
        candles: selected.to_vec(),
        prices: price_points(selected),
        percent_change: percent_change_points(selected),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChartQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartResponse {
    pub version: u64,
    pub candles: Vec<Candle>,
}

async fn get_chart(
    State(state): State<ApiState>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<ChartResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_CHART_LIMIT);
    if limit == 0 || limit > MAX_CHART_LIMIT {
        return Err(ApiError::BadRequest(format!("limit must be between 1 and {MAX_CHART_LIMIT}")));
    }

    let snapshot = state.engine.series();
    Ok(Json(ChartResponse {
        version: snapshot.version,
        candles: chart_window(&snapshot.candles, limit, state.clock.now_ms()),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub paused: bool,
    pub version: u64,
    pub candles: usize,
    pub first_bucket: Option<i64>,
    pub last_bucket: Option<i64>,
    pub metrics: BTreeMap<String, u64>,
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state.engine.series();
    Json(StatusResponse {
        connected: state.engine.is_connected(),
        connection_state: state.engine.connection_state(),
        paused: state.engine.is_paused(),
        version: snapshot.version,
        candles: snapshot.len(),
        first_bucket: snapshot.first().map(|c| c.bucket_start),
        last_bucket: snapshot.last().map(|c| c.bucket_start),
        metrics: state.engine.metrics().export(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

async fn set_pause(State(state): State<ApiState>, Json(request): Json<PauseRequest>) -> impl IntoResponse {
    let previous = state.engine.set_paused(request.paused);
    Json(json!({
        "paused": request.paused,
        "previous": previous
    }))
}
