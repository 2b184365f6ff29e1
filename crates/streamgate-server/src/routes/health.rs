//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use streamgate_core::pool::PoolHealth;

use crate::state::AppState;

/// Liveness: 200 whenever the process is responding.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: 200 iff the shared store answers a ping. Includes pool
/// utilization so load balancers can see degradation early.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => {
            let active = state.pool.global_active().await.unwrap_or(0);
            let health = PoolHealth::classify(active, state.pool.config());
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ready",
                    "pool": {
                        "active": active,
                        "max": state.pool.config().global_max,
                        "health": health,
                    },
                })),
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "message": "shared store unreachable",
                })),
            )
        }
    }
}
