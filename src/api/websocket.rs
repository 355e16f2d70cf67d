use crate::api::protocol::RelayFrame;
use crate::api::session::Session;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Request, State,
    },
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared application state for the gateway
pub struct GateAppState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<GatewayMetrics>,
    pub relay: broadcast::Sender<RelayFrame>,
}

impl GateAppState {
    pub fn new(limiter: Arc<RateLimiter>, broadcast_capacity: usize) -> Self {
        let (relay, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            limiter,
            metrics: Arc::new(GatewayMetrics::new()),
            relay,
        }
    }
}

/// Client admitted by the middleware, handed on to the upgrade handler
#[derive(Debug, Clone)]
pub struct AdmittedClient {
    /// Rate-limit key
    pub identity: String,
    pub connection_id: String,
}

/// Identity is the peer IP; requests without connect info share one bucket.
fn client_identity(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission middleware: asks the limiter before the upgrade is attempted,
/// so a refusal is a plain 429 rather than a closed socket.
///
/// The connection id is minted here so in-process admission can hold the
/// slot from the handshake on. It is released again if no upgrade follows.
async fn admit_connection(
    State(state): State<Arc<GateAppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let identity = client_identity(&req);
    let connection_id = Uuid::new_v4().to_string();

    if state
        .limiter
        .admit_connection(&identity, &connection_id)
        .await
        .is_err()
    {
        state.metrics.record_connection_refused();
        return too_many_connections(state.limiter.config().connection_window().as_secs());
    }

    state.metrics.record_connection_admitted();
    req.extensions_mut().insert(AdmittedClient {
        identity: identity.clone(),
        connection_id: connection_id.clone(),
    });

    let resp = next.run(req).await;
    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(connection_id = %connection_id, status = %resp.status(), "Upgrade refused, releasing slot");
        state.limiter.unregister_connection(&identity, &connection_id);
    }
    resp
}

fn too_many_connections(retry_after_secs: u64) -> Response {
    let mut resp = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({"error": "too many connections"})),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.max(1).to_string()) {
        resp.headers_mut().insert(header::RETRY_AFTER, value);
    }
    resp
}

/// GET /api/ws - WebSocket upgrade handler (admission handled by middleware)
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GateAppState>>,
    Extension(client): Extension<AdmittedClient>,
) -> Response {
    debug!(connection_id = %client.connection_id, "WebSocket upgrade request received");

    let release = {
        let state = Arc::clone(&state);
        let client = client.clone();
        move |e: axum::Error| {
            warn!(connection_id = %client.connection_id, error = %e, "WebSocket upgrade failed");
            state
                .limiter
                .unregister_connection(&client.identity, &client.connection_id);
        }
    };

    ws.on_failed_upgrade(release).on_upgrade(move |socket| {
        handle_socket(socket, state, client.identity, client.connection_id)
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<GateAppState>,
    identity: String,
    connection_id: String,
) {
    Session::new(connection_id, identity, state).run(socket).await;
}

/// Create WebSocket router with admission middleware applied
pub fn create_ws_router(state: Arc<GateAppState>, path: &str) -> Router {
    info!(path, "Mounting WebSocket endpoint");
    Router::new()
        .route(path, get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_connection))
        .with_state(state)
}
