#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Exchange Relay - Market Data Cache and Stream Fan-out
//!
//! Polls an exchange's snapshot endpoints on a fixed cadence, keeps a
//! running in-memory history per instrument, and streams live updates to
//! WebSocket clients, each with its own mutable subscription.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Core data types
//!   - `instrument`: Wire records, snapshots, instrument metadata
//!   - `series`: Per-instrument history and its projections
//!   - `subscription`: Per-connection subscription tracking
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream snapshot and directory sources
//!   - `services`: Cache, fetcher, metadata resolver, queries
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `source`: HTTP adapters for the upstream sources
//!   - `broadcast`: Connection sessions and push loops
//!   - `stream`: WebSocket and query HTTP server
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Directory feeds ──► MetadataResolver ──┐
//!                                         ▼
//! Snapshot relay ───► Fetcher ────────► MarketCache ──► ConnectionSession ──► Client 1
//!                     (poll cycle)                  ├─► ConnectionSession ──► Client 2
//!                                                   └─► QueryService ───────► /api
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{InstrumentId, InstrumentMetadata, Snapshot};
pub use domain::series::{InstrumentSeries, InstrumentSummary, StockUpdate};
pub use domain::subscription::{
    ConnectionId, SubscriptionManager, SubscriptionMode, SubscriptionStats, SubscriptionTarget,
};

// Ports and services
pub use application::ports::{DirectorySource, FetchError, SnapshotSource};
pub use application::services::{
    Fetcher, FetcherConfig, MarketCache, MetadataResolver, QueryService, RefreshSchedule,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerState};
pub use infrastructure::stream::{ServerError, StreamServer, StreamState};

// Broadcast hub (for integration tests)
pub use infrastructure::broadcast::{
    BroadcastHub, ConnectionSession, PushConfig, SessionError, SessionState, SharedBroadcastHub,
};

// Upstream adapters
pub use infrastructure::source::{HttpDirectorySource, RelaySnapshotSource};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
