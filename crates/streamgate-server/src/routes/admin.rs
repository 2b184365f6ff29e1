//! Admin surface: execution statistics and runtime knobs.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

/// Query parameters for statistics endpoints.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// How many recent samples to aggregate (default 1000).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    1000
}

/// `GET /api/v1/admin/execution-stats`
pub async fn execution_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let mut stages = serde_json::Map::new();
    for stage_id in state.tracker.stage_ids() {
        if let Some(stats) = state.tracker.statistics(&stage_id, query.limit) {
            stages.insert(stage_id, serde_json::to_value(stats).expect("stats serialize"));
        }
    }

    Json(json!({
        "sample_rate": state.tracker.sample_rate(),
        "stages": stages,
        "cache": state.pipeline.cache().stats(),
    }))
}

/// `GET /api/v1/admin/execution-stats/{stage_id}`
pub async fn execution_stats_for(
    State(state): State<Arc<AppState>>,
    Path(stage_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    match state.tracker.statistics(&stage_id, query.limit) {
        Some(stats) => (
            StatusCode::OK,
            Json(json!({ "stage": stage_id, "stats": stats })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no samples for stage '{stage_id}'") })),
        ),
    }
}

/// Body for runtime knob updates; absent fields are left unchanged.
#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    /// New tracker sampling rate in `[0.0, 1.0]`.
    #[serde(default)]
    pub sample_rate: Option<f64>,
    /// Toggle response caching.
    #[serde(default)]
    pub caching_enabled: Option<bool>,
    /// Toggle queue failover.
    #[serde(default)]
    pub queue_failover_enabled: Option<bool>,
}

fn knobs_json(state: &AppState) -> serde_json::Value {
    json!({
        "sample_rate": state.tracker.sample_rate(),
        "caching_enabled": state.toggles.caching_enabled(),
        "queue_failover_enabled": state.toggles.failover_enabled(),
    })
}

/// `GET /api/v1/admin/config`
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(knobs_json(&state))
}

/// `POST /api/v1/admin/config`
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    if let Some(rate) = update.sample_rate {
        if !(0.0..=1.0).contains(&rate) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "sample_rate must be between 0.0 and 1.0" })),
            );
        }
        state.tracker.set_sample_rate(rate);
        tracing::info!(rate, "tracker sample rate updated");
    }
    if let Some(enabled) = update.caching_enabled {
        state.toggles.set_caching_enabled(enabled);
        tracing::info!(enabled, "response caching toggled");
    }
    if let Some(enabled) = update.queue_failover_enabled {
        state.toggles.set_failover_enabled(enabled);
        tracing::info!(enabled, "queue failover toggled");
    }

    (StatusCode::OK, Json(knobs_json(&state)))
}
