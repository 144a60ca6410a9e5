//! Domain Layer - Core market data types and business logic.
//!
//! This layer contains the instrument records, the per-instrument time
//! series, and subscription bookkeeping. Nothing here performs I/O.

/// Instrument records, snapshots, and metadata.
pub mod instrument;

/// Per-instrument time series and projections.
pub mod series;

/// Subscription tracking and management.
pub mod subscription;
