// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health probe is public; everything
// else requires a valid Bearer token via the `AuthBearer` extractor.
//
// Error bodies are the stable `{error: kind, message}` shape from the trade
// error taxonomy; the kind also drives the HTTP status.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::errors::TradeError;
use crate::types::OrderRequest;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Orders ──────────────────────────────────────────────────
        .route("/api/v1/orders", post(place_order).get(list_orders))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/replace", post(replace_order))
        // ── Positions ───────────────────────────────────────────────
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/:id/close", post(close_position))
        // ── Diagnostics ─────────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/metrics", get(execution_metrics))
        .route("/api/v1/lp-health", get(lp_health))
        .route("/api/v1/quotes/:symbol", get(aggregated_quote))
        // ── Controls ────────────────────────────────────────────────
        .route("/api/v1/control/kill", post(control_kill))
        // ── WebSocket push ──────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Map a trade error to its HTTP status.
fn error_status(err: &TradeError) -> StatusCode {
    match err {
        TradeError::OrderNotFound(_) | TradeError::PositionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TradeError::Validation(_) | TradeError::InvalidVolume(_) => StatusCode::BAD_REQUEST,
        TradeError::SessionDown(_) | TradeError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn error_response(err: TradeError) -> axum::response::Response {
    (error_status(&err), Json(err.to_wire())).into_response()
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Orders
// =============================================================================

async fn place_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(request): Json<OrderRequest>,
) -> impl IntoResponse {
    info!(
        account = %request.account_id,
        symbol = %request.symbol,
        side = %request.side,
        volume = request.volume,
        "placeOrder received"
    );
    match state.execution.place_order(request).await {
        Ok(order_id) => {
            let order = state.execution.get_order(&order_id);
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "order_id": order_id, "order": order })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct OrdersQuery {
    account_id: String,
}

async fn list_orders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> impl IntoResponse {
    Json(state.execution.store.orders_for_account(&query.account_id))
}

async fn get_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match state.execution.get_order(&order_id) {
        Some(order) => Json(order).into_response(),
        None => error_response(TradeError::OrderNotFound(order_id)),
    }
}

async fn cancel_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match state.execution.cancel_order(&order_id).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ReplaceBody {
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
}

async fn replace_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    Json(body): Json<ReplaceBody>,
) -> impl IntoResponse {
    match state
        .execution
        .replace_order(&order_id, body.volume, body.price)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Deserialize)]
struct PositionsQuery {
    account_id: String,
    #[serde(default)]
    closed: Option<usize>,
}

async fn list_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PositionsQuery>,
) -> impl IntoResponse {
    let open = state.ledger.open_positions(&query.account_id);
    let closed = query
        .closed
        .map(|n| state.ledger.closed_positions(&query.account_id, n))
        .unwrap_or_default();
    Json(serde_json::json!({ "open": open, "closed": closed }))
}

#[derive(Deserialize, Default)]
struct CloseBody {
    #[serde(default)]
    volume: Option<f64>,
}

async fn close_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(position_id): Path<String>,
    body: Option<Json<CloseBody>>,
) -> impl IntoResponse {
    let volume = body.and_then(|Json(b)| b.volume);
    match state.execution.close_position(&position_id, volume).await {
        Ok(order_id) => Json(serde_json::json!({ "ok": true, "order_id": order_id }))
            .into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn execution_metrics(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "per_lp": state.quality.aggregates(),
        "recent": state.quality.recent(50),
    }))
}

async fn lp_health(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn aggregated_quote(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    Json(state.aggregator.top_of_book(&symbol.to_uppercase()))
}

// =============================================================================
// Controls
// =============================================================================

#[derive(Deserialize)]
struct KillBody {
    #[serde(default)]
    account_id: Option<String>,
    active: bool,
}

async fn control_kill(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<KillBody>,
) -> impl IntoResponse {
    match body.account_id {
        Some(account_id) => state.risk.set_account_kill(&account_id, body.active),
        None => state.risk.set_global_kill(body.active),
    }
    state.increment_version();
    Json(serde_json::json!({ "ok": true }))
}
