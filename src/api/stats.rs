use crate::api::websocket::GateAppState;
use crate::config::RateLimitConfig;
use crate::metrics::MetricsSnapshot;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct StatsResponse {
    admission_mode: &'static str,
    limits: RateLimitConfig,
    metrics: MetricsSnapshot,
}

pub fn create_stats_router(state: Arc<GateAppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/stats - limits in effect and gateway counters
async fn get_stats(State(state): State<Arc<GateAppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        admission_mode: state.limiter.admission_mode(),
        limits: state.limiter.config().clone(),
        metrics: state.metrics.snapshot(),
    })
}
