//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the client-facing servers.

/// Per-connection fan-out of cache contents.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// HTTP adapters for the upstream snapshot and directory sources.
pub mod source;

/// WebSocket and query HTTP server.
pub mod stream;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
