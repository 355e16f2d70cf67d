use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};

use wsgate::api::{create_router, GateAppState};
use wsgate::clock::{Clock, SystemClock};
use wsgate::config::{load_config, GateConfig, RateLimitConfig, StoreBackend};
use wsgate::rate_limit::RateLimiter;
use wsgate::store::{MemoryStore, RedisStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsgate=info".into()),
        )
        .init();

    info!("wsgate starting...");

    let config = match std::env::var("WSGATE_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading configuration file");
            load_config(&path).with_context(|| format!("Failed to load config from {}", path))?
        }
        Err(_) => GateConfig::default(),
    };

    let limits = RateLimitConfig::from_options(config.rate_limit.clone().with_env_overrides())
        .context("Invalid rate limit configuration")?;
    info!(
        max_connections_per_identity = limits.max_connections_per_identity,
        connection_window_ms = limits.connection_window_ms,
        max_messages_per_minute = limits.max_messages_per_minute,
        max_message_size_bytes = limits.max_message_size_bytes,
        burst_factor = limits.burst_factor,
        burst_duration_ms = limits.burst_duration_ms,
        failure_policy = limits.failure_policy.as_str(),
        "Rate limits loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new(Arc::clone(&clock)));
            spawn_purge_task(
                Arc::clone(&store),
                Duration::from_secs(config.server.purge_interval_seconds.max(1)),
            );
            info!("Using in-process counter store");
            RateLimiter::in_process(limits, store, clock)
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.redis_url)
                .await
                .context("Failed to connect to Redis counter store")?;
            info!("Using Redis counter store");
            RateLimiter::with_store(limits, Arc::new(store), clock)
        }
    };

    let state = Arc::new(GateAppState::new(
        Arc::new(limiter),
        config.server.broadcast_capacity,
    ));
    let app = create_router(state, &config.server.ws_path);

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Server running");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("wsgate shut down");
    Ok(())
}

/// Periodically drop expired counters from the in-process store
fn spawn_purge_task(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                debug!(removed, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
