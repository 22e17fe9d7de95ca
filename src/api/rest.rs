// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only. Series are addressed
// as `/:symbol/:timeframe`, e.g. `/api/v1/indicators/BTCUSDT/1m`.
//
// A series that is still warming up answers 200 with
// `status: "insufficient_history"` and the per-indicator progress; an
// unconfigured series answers 404.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::market_data::validation::normalize_symbol;
use crate::types::{SeriesKey, Timeframe};

/// Default and maximum `limit` for the candles endpoint.
const DEFAULT_CANDLE_LIMIT: usize = 100;
const MAX_CANDLE_LIMIT: usize = 1_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/config", get(config))
        .route("/api/v1/series", get(series))
        .route("/api/v1/indicators/:symbol/:timeframe", get(indicators))
        .route("/api/v1/candles/:symbol/:timeframe", get(candles))
        .route("/api/v1/signals/:symbol/:timeframe", get(signals))
        .route("/api/v1/performance", get(performance))
        .route("/api/v1/performance/:symbol/:timeframe", get(series_performance))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

fn error_response(e: EngineError) -> Response {
    match e {
        EngineError::InsufficientHistory { key, pending } => Json(serde_json::json!({
            "status": "insufficient_history",
            "key": key,
            "pending": pending,
        }))
        .into_response(),
        EngineError::UnknownSeries(key) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "unknown_series",
                "error": format!("series {key} is not configured"),
            })),
        )
            .into_response(),
        other => {
            warn!(error = %other, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "error": other.to_string() })),
            )
                .into_response()
        }
    }
}

fn bad_request(msg: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "status": "bad_request", "error": msg })),
    )
        .into_response()
}

/// Resolve `/:symbol/:timeframe` into a series key.
fn parse_key(symbol: &str, timeframe: &str) -> Result<SeriesKey, Response> {
    let symbol = normalize_symbol(symbol).map_err(|e| bad_request(e.to_string()))?;
    let timeframe: Timeframe = timeframe.parse().map_err(bad_request)?;
    Ok(SeriesKey::new(symbol, timeframe))
}

// =============================================================================
// Health / metrics / config
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics_snapshot())
}

async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.runtime_config.read().clone();
    Json(config)
}

async fn series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.series())
}

// =============================================================================
// Series queries
// =============================================================================

async fn indicators(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Response {
    let key = match parse_key(&symbol, &timeframe) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match state.indicator_report(&key) {
        Ok(report) => Json(serde_json::json!({
            "status": "ok",
            "indicators": report.indicators,
            "signals": report.signals,
            "alerts": report.alerts,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CandleQuery {
    limit: Option<usize>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<CandleQuery>,
) -> Response {
    let key = match parse_key(&symbol, &timeframe) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CANDLE_LIMIT)
        .clamp(1, MAX_CANDLE_LIMIT);
    match state.candles(&key, limit) {
        Ok(window) => Json(window).into_response(),
        Err(e) => error_response(e),
    }
}

async fn signals(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Response {
    let key = match parse_key(&symbol, &timeframe) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match state.signals(&key) {
        Ok(window) => Json(window).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Alert performance
// =============================================================================

async fn performance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.performance())
}

async fn series_performance(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Response {
    let key = match parse_key(&symbol, &timeframe) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match state.performance_of(&key) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::tests::state_with_candles;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn warming_series_reports_pending() {
        let app = router(Arc::new(state_with_candles(5)));
        let (status, body) = get_json(app, "/api/v1/indicators/BTCUSDT/1m").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "insufficient_history");
        assert_eq!(body["pending"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn warm_series_returns_indicators() {
        let app = router(Arc::new(state_with_candles(40)));
        let (status, body) = get_json(app, "/api/v1/indicators/btcusdt/1m").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["indicators"]["rsi"]["status"], "ready");
        assert!(body["indicators"]["macd"]["value"]["histogram"].is_number());
        assert_eq!(body["signals"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_series_is_404() {
        let app = router(Arc::new(state_with_candles(1)));
        let (status, body) = get_json(app, "/api/v1/indicators/ETHUSDT/1m").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "unknown_series");
    }

    #[tokio::test]
    async fn bad_timeframe_is_400() {
        let app = router(Arc::new(state_with_candles(1)));
        let (status, _) = get_json(app, "/api/v1/candles/BTCUSDT/7m").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn candles_respect_limit() {
        let app = router(Arc::new(state_with_candles(30)));
        let (status, body) = get_json(app, "/api/v1/candles/BTCUSDT/1m?limit=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closed"].as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn health_and_metrics() {
        let state = Arc::new(state_with_candles(3));
        let (status, body) = get_json(router(Arc::clone(&state)), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connection"]["state"], "connected");

        let (_, body) = get_json(router(state), "/api/v1/metrics").await;
        assert_eq!(body["candles_closed"], 3);
    }

    #[tokio::test]
    async fn performance_endpoints() {
        let state = Arc::new(state_with_candles(40));
        let (status, body) = get_json(router(Arc::clone(&state)), "/api/v1/performance").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["overall"]["win_rate"].is_number());
        assert_eq!(body["series"][0]["key"]["symbol"], "BTCUSDT");

        let (status, body) =
            get_json(router(Arc::clone(&state)), "/api/v1/performance/BTCUSDT/1m").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["accuracy_by_indicator"].is_object());

        let (status, _) = get_json(router(state), "/api/v1/performance/ETHUSDT/1m").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
