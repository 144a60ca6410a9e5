//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Fetching**: Poll cycles, failed source calls, empty cycles, cycle latency
//! - **Cache**: Number of instruments held
//! - **Streaming**: Active WebSocket connections, updates sent, client errors
//! - **Metadata**: Directory refresh outcomes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Fetching
    describe_counter!(
        "exchange_relay_fetch_cycles_total",
        "Total poll cycles run by the fetcher"
    );
    describe_counter!(
        "exchange_relay_empty_cycles_total",
        "Poll cycles that produced no data"
    );
    describe_counter!(
        "exchange_relay_source_failures_total",
        "Failed upstream calls by call name"
    );
    describe_histogram!(
        "exchange_relay_fetch_cycle_seconds",
        "Wall time of one poll cycle including the cache update"
    );

    // Cache
    describe_gauge!(
        "exchange_relay_cached_instruments",
        "Number of instruments with a series in the cache"
    );

    // Metadata
    describe_counter!(
        "exchange_relay_metadata_refreshes_total",
        "Directory refresh attempts by outcome"
    );

    // Streaming
    describe_gauge!(
        "exchange_relay_active_connections",
        "Number of open WebSocket connections"
    );
    describe_counter!(
        "exchange_relay_updates_sent_total",
        "Messages sent to WebSocket clients by type"
    );
    describe_counter!(
        "exchange_relay_client_errors_total",
        "Rejected client messages by reason"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCall {
    /// Client-type snapshot.
    ClientType,
    /// Per-flow trade snapshot.
    Trades,
    /// Per-flow best limits.
    BestLimits,
    /// Directory listing.
    Listing,
    /// Daily valuation details.
    DailyDetails,
    /// Static instrument flags.
    StaticDetails,
}

impl SourceCall {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientType => "client_type",
            Self::Trades => "trades",
            Self::BestLimits => "best_limits",
            Self::Listing => "listing",
            Self::DailyDetails => "daily_details",
            Self::StaticDetails => "static_details",
        }
    }
}

/// Record the outcome of one poll cycle.
pub fn record_fetch_cycle(duration: Duration, empty: bool) {
    counter!("exchange_relay_fetch_cycles_total").increment(1);
    if empty {
        counter!("exchange_relay_empty_cycles_total").increment(1);
    }
    histogram!("exchange_relay_fetch_cycle_seconds").record(duration.as_secs_f64());
}

/// Record a failed upstream call.
pub fn record_source_failure(call: SourceCall) {
    counter!(
        "exchange_relay_source_failures_total",
        "call" => call.as_str()
    )
    .increment(1);
}

/// Update the number of cached instruments.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_instruments(count: usize) {
    gauge!("exchange_relay_cached_instruments").set(count as f64);
}

/// Record a directory refresh attempt.
pub fn record_metadata_refresh(success: bool) {
    counter!(
        "exchange_relay_metadata_refreshes_total",
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Update the open WebSocket connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_connections(count: usize) {
    gauge!("exchange_relay_active_connections").set(count as f64);
}

/// Record a message sent to a WebSocket client.
pub fn record_update_sent(message_type: &'static str) {
    counter!(
        "exchange_relay_updates_sent_total",
        "message_type" => message_type
    )
    .increment(1);
}

/// Record a rejected client message.
pub fn record_client_error(reason: &'static str) {
    counter!(
        "exchange_relay_client_errors_total",
        "reason" => reason
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
