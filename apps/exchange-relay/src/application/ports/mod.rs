//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `SnapshotSource`: per-call access to the exchange snapshot endpoints
//! - `DirectorySource`: access to the instrument directory and detail feeds

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::instrument::{
    ClientTypeRecord, InstrumentId, OrderBookLevels, RawRecord, TradeRecord,
};

/// A market flow partition (1, 2, 4, 7 on the exchange).
pub type Flow = u8;

/// Raw directory feed: instrument ID to record.
pub type RawDirectory = HashMap<InstrumentId, RawRecord>;

/// Error from an upstream source call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Request could not be sent or timed out.
    #[error("transport error: {message}")]
    Transport {
        /// Error details.
        message: String,
    },

    /// Upstream answered with a non-success status.
    #[error("upstream returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Response body did not have the expected shape.
    #[error("malformed response: {message}")]
    Malformed {
        /// Error details.
        message: String,
    },
}

impl FetchError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Malformed { .. } => false,
        }
    }
}

/// Port for the exchange's per-cycle snapshot calls.
///
/// Each method maps to one remote call. Results are keyed by instrument.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Client-type breakdown for all instruments.
    async fn fetch_client_type(&self) -> Result<HashMap<InstrumentId, ClientTypeRecord>, FetchError>;

    /// Trade data for one market flow.
    async fn fetch_trades(&self, flow: Flow) -> Result<HashMap<InstrumentId, TradeRecord>, FetchError>;

    /// Best limits (order book) for one market flow.
    async fn fetch_best_limits(
        &self,
        flow: Flow,
    ) -> Result<HashMap<InstrumentId, OrderBookLevels>, FetchError>;
}

/// Port for the instrument directory feeds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Authoritative listing of instruments with descriptive fields.
    async fn fetch_listing(&self) -> Result<RawDirectory, FetchError>;

    /// Daily valuation details (P/E, price bounds, NAV).
    async fn fetch_daily_details(&self) -> Result<RawDirectory, FetchError>;

    /// Static per-instrument flags.
    async fn fetch_static_details(&self) -> Result<RawDirectory, FetchError>;
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(FetchError::Transport { message: "timeout".into() }, true ; "transport")]
    #[test_case(FetchError::Status { status: 503, body: String::new() }, true ; "server error")]
    #[test_case(FetchError::Status { status: 429, body: String::new() }, true ; "rate limited")]
    #[test_case(FetchError::Status { status: 404, body: String::new() }, false ; "not found")]
    #[test_case(FetchError::Malformed { message: "eof".into() }, false ; "malformed")]
    fn fetch_error_transience(error: FetchError, expected: bool) {
        assert_eq!(error.is_transient(), expected);
    }
}
