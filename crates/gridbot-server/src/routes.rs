//! Control-surface routes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use gridbot_core::Symbol;
use gridbot_engine::{Controller, EngineError, EngineResult, GridParameters};
use gridbot_feed::FeedHandle;
use gridbot_persistence::{DynStore, StoreEvent};

use crate::alerts::{AlertPayload, AlertRouter, GridAction};

/// Signature header for webhook alerts.
const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub feed: FeedHandle,
    pub alerts: Arc<AlertRouter>,
    pub store: DynStore,
}

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/grids", get(all_grids))
        .route("/api/grids/:symbol", get(one_grid))
        .route("/api/grids/:symbol/start", post(start_grid))
        .route("/api/pause", post(pause_all))
        .route("/api/pause/:symbol", post(pause_one))
        .route("/api/resume", post(resume_all))
        .route("/api/resume/:symbol", post(resume_one))
        .route("/api/rebalance", post(rebalance_all))
        .route("/api/deploy", post(deploy))
        .route("/api/risk", get(risk_status))
        .route("/api/kill", post(kill))
        .route("/api/reset-kill", post(reset_kill))
        .route("/api/prices", get(prices))
        .route("/api/tv-alert", post(tv_alert))
        .route("/api/alerts", get(alert_history))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn run_server(state: AppState, port: u16) -> std::io::Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting control server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

// ============================================================================
// Error mapping
// ============================================================================

/// Map an engine error onto an HTTP response.
///
/// Gate refusals (blocked, stop-loss) are business outcomes, not
/// transport failures: they come back as 200 with `status: "blocked"`.
fn engine_error_response(error: &EngineError) -> Response {
    let body = json!({
        "status": match error {
            EngineError::Blocked(_) | EngineError::StopLossTripped(_) => "blocked",
            EngineError::KilledByRisk(_) => "forbidden",
            _ => "error",
        },
        "code": error.code(),
        "reason": error.to_string(),
    });

    let status = match error {
        EngineError::Blocked(_) | EngineError::StopLossTripped(_) => StatusCode::OK,
        EngineError::KilledByRisk(_) => StatusCode::FORBIDDEN,
        EngineError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
        EngineError::ExchangeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(body)).into_response()
}

/// Render one per-symbol outcome of a fanout operation.
fn outcome_value<T: serde::Serialize>(result: &EngineResult<T>) -> Value {
    match result {
        Ok(outcome) => json!({ "status": "ok", "result": outcome }),
        Err(error) => json!({
            "status": "error",
            "code": error.code(),
            "reason": error.to_string(),
        }),
    }
}

fn fanout_response<T: serde::Serialize>(
    status: &str,
    results: Vec<(Symbol, EngineResult<T>)>,
) -> Json<Value> {
    let results: HashMap<String, Value> = results
        .iter()
        .map(|(symbol, result)| (symbol.to_string(), outcome_value(result)))
        .collect();
    Json(json!({ "status": status, "results": results }))
}

// ============================================================================
// Read endpoints
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "grid_engine": true,
        "risk_manager": true,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.controller.snapshot().await;
    Json(json!({
        "grids": snapshot.grids,
        "risk": snapshot.risk,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn all_grids(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.controller.snapshot().await;
    Json(serde_json::to_value(snapshot.grids).unwrap_or_default())
}

async fn one_grid(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let symbol = Symbol::new(symbol);
    match state.controller.grid_snapshot(&symbol).await {
        Ok(snap) => Json(snap).into_response(),
        Err(e) => engine_error_response(&e),
    }
}

async fn risk_status(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.controller.risk().snapshot()).unwrap_or_default())
}

async fn prices(State(state): State<AppState>) -> Json<Value> {
    let prices: HashMap<String, Value> = state
        .feed
        .cached_all()
        .into_iter()
        .map(|tick| {
            let price: f64 = tick.price.inner().to_string().parse().unwrap_or(0.0);
            (
                tick.symbol.to_string(),
                json!({ "price": price, "ts": tick.ts_ms }),
            )
        })
        .collect();
    Json(json!(prices))
}

// ============================================================================
// Control endpoints
// ============================================================================

async fn start_grid(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let symbol = Symbol::new(symbol);
    match state.controller.start(&symbol).await {
        Ok(outcome) => Json(json!({
            "status": "started",
            "symbol": symbol.to_string(),
            "result": outcome,
        }))
        .into_response(),
        Err(e) => engine_error_response(&e),
    }
}

async fn pause_all(State(state): State<AppState>) -> Json<Value> {
    fanout_response("paused", state.controller.pause_all().await)
}

async fn pause_one(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let symbol = Symbol::new(symbol);
    match state.controller.pause(&symbol).await {
        Ok(outcome) => Json(json!({
            "status": "paused",
            "symbol": symbol.to_string(),
            "result": outcome,
        }))
        .into_response(),
        Err(e) => engine_error_response(&e),
    }
}

async fn resume_all(State(state): State<AppState>) -> Json<Value> {
    fanout_response("resumed", state.controller.resume_all().await)
}

async fn resume_one(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let symbol = Symbol::new(symbol);
    match state.controller.resume(&symbol).await {
        Ok(outcome) => Json(json!({
            "status": "resumed",
            "symbol": symbol.to_string(),
            "result": outcome,
        }))
        .into_response(),
        Err(e) => engine_error_response(&e),
    }
}

async fn rebalance_all(State(state): State<AppState>) -> Json<Value> {
    fanout_response("rebalanced", state.controller.rebalance_all().await)
}

async fn deploy(State(state): State<AppState>, payload: Json<GridParameters>) -> Response {
    let params = payload.0;
    let symbol = params.symbol.clone();
    match state.controller.deploy(params.clone()).await {
        Ok(()) => Json(json!({
            "status": "deployed",
            "symbol": symbol.to_string(),
            "config": params,
        }))
        .into_response(),
        Err(e) => engine_error_response(&e),
    }
}

async fn kill(State(state): State<AppState>) -> Json<Value> {
    warn!("Manual kill requested over HTTP");
    let results = state.controller.kill("Manual kill switch activated").await;
    fanout_response("killed", results)
}

async fn reset_kill(State(state): State<AppState>) -> Response {
    match state.controller.reset_kill() {
        Ok(()) => Json(json!({ "status": "reset" })).into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "conflict", "reason": e.to_string() })),
        )
            .into_response(),
    }
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub symbol: Option<String>,
    pub limit: Option<usize>,
}

async fn alert_history(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    let alerts = state.alerts.recent(query.symbol.as_deref(), limit);
    Json(json!({
        "alerts": alerts,
        "stats": state.alerts.stats(),
    }))
}

async fn tv_alert(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    // Signature over the exact received bytes, before any parsing
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !state.alerts.validate_signature(&body, signature) {
        warn!("Webhook rejected: bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "unauthorized", "reason": "Invalid webhook signature" })),
        )
            .into_response();
    }

    let payload: AlertPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "bad_request", "reason": format!("Malformed alert: {e}") })),
            )
                .into_response();
        }
    };

    // The kill latch forbids webhook-driven trading outright
    if state.controller.risk().latch().is_triggered() {
        let reason = state.controller.risk().latch().reason().unwrap_or_default();
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "status": "forbidden", "reason": format!("Kill switch: {reason}") })),
        )
            .into_response();
    }

    let alert = match state.alerts.parse(&payload) {
        Ok(alert) => alert,
        Err(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "bad_request", "reason": reason })),
            )
                .into_response();
        }
    };

    let live_price = state.feed.cached(&alert.symbol).map(|t| t.price);
    if let Err(reason) = state.alerts.should_execute(&alert, live_price) {
        state.alerts.record(&alert, false, Some(reason.clone()));
        state.store.record(StoreEvent::Alert {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            symbol: alert.symbol.to_string(),
            action: alert.action.as_str().to_string(),
            accepted: false,
            detail: Some(reason.clone()),
        });
        return Json(json!({
            "alert": alert.symbol.to_string(),
            "action": alert.action.as_str(),
            "status": "rejected",
            "reason": reason,
        }))
        .into_response();
    }

    let grid_result = match alert.action {
        GridAction::Resume => outcome_value(&state.controller.resume(&alert.symbol).await),
        GridAction::Pause => outcome_value(&state.controller.pause(&alert.symbol).await),
        GridAction::Stop => outcome_value(&state.controller.stop(&alert.symbol).await),
    };

    let accepted = grid_result.get("status").and_then(Value::as_str) == Some("ok");
    state.alerts.record(&alert, accepted, None);
    state.store.record(StoreEvent::Alert {
        ts_ms: chrono::Utc::now().timestamp_millis(),
        symbol: alert.symbol.to_string(),
        action: alert.action.as_str().to_string(),
        accepted,
        detail: None,
    });

    Json(json!({
        "alert": alert.symbol.to_string(),
        "action": alert.action.as_str(),
        "grid_result": grid_result,
    }))
    .into_response()
}
