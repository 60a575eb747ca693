//! HTTP API for the query console.
//!
//! Exposes query execution and pool diagnostics as JSON endpoints for a
//! browser front end served from another origin.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::ConsoleError;
use crate::pool::PoolStats;
use crate::query::{ExecuteRequest, ExecuteResponse, QueryExecutor};

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<QueryExecutor>,
}

#[derive(Debug, Serialize)]
struct PoolStatsResponse {
    pools: Vec<PoolStats>,
}

/// Builds the router with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(execute_query))
        .route("/api/pool-stats", get(pool_stats))
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn execute_query(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> impl IntoResponse {
    let response = match payload {
        Ok(Json(request)) => state.executor.handle(&request).await,
        Err(rejection) => {
            warn!("Malformed query request: {}", rejection.body_text());
            ExecuteResponse::failure(
                &ConsoleError::invalid_request(rejection.body_text()),
                std::time::Duration::ZERO,
            )
        }
    };

    let status = StatusCode::from_u16(response.status().http_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response))
}

async fn pool_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(PoolStatsResponse {
        pools: state.executor.pool_stats().await,
    })
}
