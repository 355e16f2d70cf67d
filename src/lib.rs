// Clock abstraction for counter expiry
pub mod clock;

// Configuration (TOML file + env overrides)
pub mod config;

// Counter stores (in-process and Redis)
pub mod store;

// Connection admission and message throughput limits
pub mod rate_limit;

// Gateway counters
pub mod metrics;

// HTTP and WebSocket APIs
pub mod api;
