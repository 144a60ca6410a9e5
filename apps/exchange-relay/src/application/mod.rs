//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for upstream sources.
pub mod ports;

/// Application services: cache, fetcher, metadata, queries.
pub mod services;
