//! Streamgate HTTP API server.
//!
//! Exposes the core request pipeline as a versioned REST surface: the
//! SSE streaming endpoint, health probes, and the admin statistics and
//! runtime-knob endpoints. Middleware order, from outermost to
//! innermost: trace → CORS → security headers → thread-ID extraction,
//! so every response (including rejections) carries CORS, security
//! headers, and the thread id. The admission gate runs first in the
//! stream handler, before any pool or pipeline work.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the complete axum router with all API routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/stream", post(routes::stream::stream))
        .route("/health", get(routes::health::health))
        .route("/health/ready", get(routes::health::ready))
        .route("/admin/execution-stats", get(routes::admin::execution_stats))
        .route(
            "/admin/execution-stats/{stage_id}",
            get(routes::admin::execution_stats_for),
        )
        .route(
            "/admin/config",
            get(routes::admin::get_config).post(routes::admin::update_config),
        )
        .layer(axum::middleware::from_fn(middleware::thread_id));

    Router::new()
        .nest("/api/v1", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::security_headers,
        ))
        .layer(middleware::cors_layer(&state.config.server))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
