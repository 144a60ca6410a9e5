//! Query Service
//!
//! Read-only surface over the cache and directory for the transport layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::cache::MarketCache;
use super::metadata::MetadataResolver;
use crate::domain::instrument::{Directory, InstrumentId, InstrumentMetadata};
use crate::domain::series::{InstrumentSeries, InstrumentSummary};

/// Queries exposed to HTTP and WebSocket handlers.
#[derive(Debug, Clone)]
pub struct QueryService {
    cache: Arc<MarketCache>,
    resolver: Arc<MetadataResolver>,
}

impl QueryService {
    /// Create a query service.
    #[must_use]
    pub const fn new(cache: Arc<MarketCache>, resolver: Arc<MetadataResolver>) -> Self {
        Self { cache, resolver }
    }

    /// Full history of one instrument; empty for unknown IDs.
    #[must_use]
    pub fn stock_data(&self, id: &str) -> InstrumentSeries {
        self.cache.get(id)
    }

    /// Full history of every instrument.
    #[must_use]
    pub fn all_data(&self) -> BTreeMap<InstrumentId, InstrumentSeries> {
        self.cache.get_all()
    }

    /// Latest-value summary of every instrument with samples.
    #[must_use]
    pub fn all_stocks_summary(&self) -> BTreeMap<InstrumentId, InstrumentSummary> {
        self.cache.summary()
    }

    /// Directory of valid instruments.
    #[must_use]
    pub fn all_metadata(&self) -> Directory {
        let cached = self.cache.all_metadata();
        if cached.is_empty() {
            self.resolver.all()
        } else {
            cached
        }
    }

    /// Metadata of one instrument; empty for unknown IDs.
    #[must_use]
    pub fn stock_metadata(&self, id: &str) -> InstrumentMetadata {
        let cached = self.cache.metadata(id);
        if cached == InstrumentMetadata::default() {
            self.resolver.simplified(id)
        } else {
            cached
        }
    }

    /// Every listed instrument ID; falls back to cached IDs before the first directory load.
    #[must_use]
    pub fn stock_ids(&self) -> Vec<InstrumentId> {
        let ids = self.resolver.stock_ids();
        if ids.is_empty() {
            self.cache.instrument_ids()
        } else {
            ids
        }
    }

    /// Underlying cache, for readiness and diagnostics.
    #[must_use]
    pub const fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    /// Underlying resolver, for diagnostics.
    #[must_use]
    pub const fn resolver(&self) -> &Arc<MetadataResolver> {
        &self.resolver
    }
}
