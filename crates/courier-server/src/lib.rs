//! Server-side wiring for Courier: configuration, HTTP/WebSocket routes,
//! and Prometheus metrics. Relay semantics live in `courier-core`.

pub mod config;
pub mod handlers;
pub mod metrics;
