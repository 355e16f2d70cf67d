// HTTP and WebSocket APIs

pub mod protocol;
pub mod session;
pub mod stats;
pub mod websocket;

pub use stats::create_stats_router;
pub use websocket::{create_ws_router, ws_handler, AdmittedClient, GateAppState};

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Full gateway router: WebSocket endpoint plus health and stats.
pub fn create_router(state: Arc<GateAppState>, ws_path: &str) -> Router {
    create_ws_router(Arc::clone(&state), ws_path)
        .merge(create_stats_router(state))
        .layer(CorsLayer::permissive())
}
