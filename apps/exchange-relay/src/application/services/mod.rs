//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MarketCache`: per-instrument time-series store
//! - `MetadataResolver`: instrument directory with daily refresh
//! - `Fetcher`: poll loop feeding the cache
//! - `QueryService`: read-only query surface

pub mod backoff;
pub mod cache;
pub mod fetcher;
pub mod metadata;
pub mod query;

pub use backoff::{RetryConfig, RetryPolicy};
pub use cache::{CacheStats, KeepAll, MarketCache, RetentionPolicy, UpdateReport};
pub use fetcher::{CycleReport, DEFAULT_FLOWS, Fetcher, FetcherConfig};
pub use metadata::{MetadataResolver, RefreshSchedule};
pub use query::QueryService;
