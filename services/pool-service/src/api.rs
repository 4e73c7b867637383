//! HTTP control API
//!
//! All mutating endpoints delegate to the pool coordinator; handlers hold
//! no state of their own, so the API surface stays safe under concurrent
//! callers. Replenish and refresh requests are acknowledged with 202 and
//! run in background tasks since both involve slow network workflows.

use std::sync::Arc;
use std::time::Duration;

use account_pool::{Error as PoolError, Pool, Refresher, Registrar, ReplenishConfig};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{error, info};

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub registrar: Arc<dyn Registrar>,
    pub refresher: Arc<dyn Refresher>,
    pub replenish: ReplenishConfig,
    pub refresh_margin: Duration,
    pub started_at: std::time::Instant,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/accounts/status", get(status_handler))
        .route("/api/accounts/allocate", post(allocate_handler))
        .route("/api/accounts/release", post(release_handler))
        .route("/api/accounts/replenish", post(replenish_handler))
        .route("/api/accounts/refresh-tokens", post(refresh_tokens_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Map coordinator errors onto API status codes.
fn error_response(e: &PoolError) -> (StatusCode, serde_json::Value) {
    let (status, kind) = match e {
        PoolError::InsufficientPool { .. } => (StatusCode::CONFLICT, "insufficient_pool"),
        PoolError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        PoolError::NotOwner(_) => (StatusCode::FORBIDDEN, "not_owner"),
        PoolError::Registration(_) | PoolError::Refresh(_) => (StatusCode::BAD_GATEWAY, "upstream"),
        PoolError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
    };
    (
        status,
        serde_json::json!({
            "error": { "type": kind, "message": e.to_string() }
        }),
    )
}

/// Liveness only: never touches the pool or the store lock. Pool counts
/// live on the status endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pool.status().await;
    match serde_json::to_value(&snapshot) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "could not serialize pool snapshot");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": {"type": "internal", "message": "serialization failed"}}),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct AllocateRequest {
    count: Option<usize>,
    requester: Option<String>,
}

async fn allocate_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<AllocateRequest>,
) -> impl IntoResponse {
    let count = req.count.unwrap_or(state.pool.config().accounts_per_request);
    let requester = req
        .requester
        .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4().as_simple()));

    match state.pool.allocate(count, &requester).await {
        Ok(accounts) => {
            let granted = accounts.len();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "accounts": accounts,
                    "granted": granted,
                    "requester": requester,
                }),
            )
        }
        Err(e) => {
            let (status, body) = error_response(&e);
            json_response(status, body)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    id: String,
    requester: String,
}

async fn release_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<ReleaseRequest>,
) -> impl IntoResponse {
    match state.pool.release(&req.id, &req.requester).await {
        Ok(released) => json_response(StatusCode::OK, serde_json::json!({"released": released})),
        Err(e) => {
            let (status, body) = error_response(&e);
            json_response(status, body)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplenishRequest {
    count: usize,
}

/// Accept up to `count` registrations, capped by remaining pool capacity,
/// and run them in the background.
async fn replenish_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<ReplenishRequest>,
) -> impl IntoResponse {
    let accepted = req.count.min(state.pool.capacity_remaining().await);
    if accepted > 0 {
        let pool = state.pool.clone();
        let registrar = state.registrar.clone();
        let config = state.replenish.clone();
        tokio::spawn(async move {
            let provisioned =
                account_pool::run_replenish_cycle(&pool, registrar.as_ref(), &config, Some(accepted))
                    .await;
            info!(requested = accepted, provisioned, "manual replenish finished");
            pool.update_gauges().await;
        });
    }
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({"accepted": accepted}),
    )
}

/// Kick off a refresh cycle immediately instead of waiting for the next
/// scheduled tick. The per-account rate floor still applies.
async fn refresh_tokens_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.clone();
    let refresher = state.refresher.clone();
    let margin = state.refresh_margin;
    tokio::spawn(async move {
        let renewed = account_pool::run_refresh_cycle(&pool, refresher.as_ref(), margin).await;
        info!(renewed, "manual refresh finished");
        pool.update_gauges().await;
    });
    json_response(StatusCode::ACCEPTED, serde_json::json!({"accepted": true}))
}
