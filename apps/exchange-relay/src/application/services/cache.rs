//! Market Cache
//!
//! Concurrency-safe store of per-instrument history. The fetcher is the only
//! writer; any number of connection loops and query handlers read from it.
//!
//! A single `parking_lot::Mutex` guards the whole store. It is taken once per
//! read and once per instrument append, and never held across an `.await`,
//! so a reader never observes a partially appended field group.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::instrument::{Directory, InstrumentId, InstrumentMetadata, Snapshot};
use crate::domain::series::{InstrumentSeries, InstrumentSummary, SampleCounts, StockUpdate};
use crate::infrastructure::metrics;

// =============================================================================
// Retention
// =============================================================================

/// Hook run on a series right after each append, under the cache lock.
///
/// Implementations trim whole field groups; vectors within a group must
/// keep equal lengths.
pub trait RetentionPolicy: Send + Sync + fmt::Debug {
    /// Trim or otherwise adjust the series.
    fn apply(&self, id: &str, series: &mut InstrumentSeries);
}

/// Keeps the full history.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
    fn apply(&self, _id: &str, _series: &mut InstrumentSeries) {}
}

// =============================================================================
// Cache State
// =============================================================================

#[derive(Debug, Default)]
struct CacheState {
    series: BTreeMap<InstrumentId, InstrumentSeries>,
    directory: Directory,
    last_update: Option<DateTime<Utc>>,
}

impl CacheState {
    fn metadata_for(&self, id: &str) -> InstrumentMetadata {
        self.directory.get(id).cloned().unwrap_or_default()
    }
}

/// Result of one cache update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Instruments that received a trade sample.
    pub appended: usize,
    /// Series created during this update.
    pub created: usize,
    /// Whether the directory was replaced.
    pub metadata_replaced: bool,
}

/// Diagnostics view of the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of series.
    pub instrument_count: usize,
    /// Series with at least one trade sample.
    pub instruments_with_samples: usize,
    /// Entries in the current directory.
    pub directory_size: usize,
    /// Time of the last non-empty update.
    pub last_update: Option<DateTime<Utc>>,
    /// Sample counts per instrument.
    pub samples: BTreeMap<InstrumentId, SampleCounts>,
}

// =============================================================================
// Market Cache
// =============================================================================

/// In-memory time-series cache shared by the whole process.
pub struct MarketCache {
    state: Mutex<CacheState>,
    retention: Box<dyn RetentionPolicy>,
}

impl fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketCache")
            .field("instruments", &self.state.lock().series.len())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketCache {
    /// Create an empty cache that keeps the full history.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(Box::new(KeepAll))
    }

    /// Create an empty cache with a custom retention policy.
    #[must_use]
    pub fn with_retention(retention: Box<dyn RetentionPolicy>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            retention,
        }
    }

    /// Ingest one snapshot, optionally replacing the directory first.
    ///
    /// Each instrument in `snapshot.trade` gets one trade-core sample, one
    /// order-book sample (missing levels zero-filled), and a client-type
    /// sample when the snapshot carries one for it. A snapshot without trade
    /// data is skipped and leaves the last-update time untouched.
    pub fn update(&self, snapshot: &Snapshot, metadata: Option<Directory>) -> UpdateReport {
        let mut report = UpdateReport::default();

        if let Some(directory) = metadata {
            let mut state = self.state.lock();
            state.directory = directory;
            let CacheState {
                series, directory, ..
            } = &mut *state;
            for (id, entry) in series.iter_mut() {
                entry.metadata = directory.get(id).cloned().unwrap_or_default();
            }
            report.metadata_replaced = true;
            tracing::info!(entries = directory.len(), "Instrument directory replaced");
        }

        if snapshot.trade.is_empty() {
            tracing::warn!("Snapshot has no trade data, skipping cache update");
            return report;
        }

        let now = Utc::now();
        for (id, trade) in &snapshot.trade {
            let mut state = self.state.lock();
            if !state.series.contains_key(id) {
                let metadata = state.metadata_for(id);
                state
                    .series
                    .insert(id.clone(), InstrumentSeries::with_metadata(metadata));
                report.created += 1;
            }
            let Some(series) = state.series.get_mut(id) else {
                continue;
            };

            series.append_trade(now, trade);
            if let Some(client_type) = snapshot.client_type.get(id) {
                series.append_client_type(client_type);
            }
            series.append_order_book(snapshot.limits.get(id));
            self.retention.apply(id, series);
            report.appended += 1;
        }

        let instruments = {
            let mut state = self.state.lock();
            state.last_update = Some(now);
            state.series.len()
        };
        metrics::set_cached_instruments(instruments);

        tracing::debug!(
            appended = report.appended,
            created = report.created,
            instruments,
            "Cache updated"
        );
        report
    }

    /// Full series of one instrument; empty for unknown IDs.
    #[must_use]
    pub fn get(&self, id: &str) -> InstrumentSeries {
        self.state.lock().series.get(id).cloned().unwrap_or_default()
    }

    /// Full series of every instrument.
    #[must_use]
    pub fn get_all(&self) -> BTreeMap<InstrumentId, InstrumentSeries> {
        self.state.lock().series.clone()
    }

    /// Latest-value summary of every instrument with at least one sample.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<InstrumentId, InstrumentSummary> {
        self.state
            .lock()
            .series
            .iter()
            .filter_map(|(id, series)| series.summary().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Summary entries for the given IDs, skipping those without samples.
    #[must_use]
    pub fn summary_of<'a, I>(&self, ids: I) -> BTreeMap<InstrumentId, InstrumentSummary>
    where
        I: IntoIterator<Item = &'a InstrumentId>,
    {
        let state = self.state.lock();
        ids.into_iter()
            .filter_map(|id| {
                state
                    .series
                    .get(id)
                    .and_then(InstrumentSeries::summary)
                    .map(|summary| (id.clone(), summary))
            })
            .collect()
    }

    /// Latest-value projection for the given IDs, skipping those without samples.
    #[must_use]
    pub fn latest<'a, I>(&self, ids: I) -> BTreeMap<InstrumentId, StockUpdate>
    where
        I: IntoIterator<Item = &'a InstrumentId>,
    {
        let state = self.state.lock();
        ids.into_iter()
            .filter_map(|id| {
                state
                    .series
                    .get(id)
                    .and_then(InstrumentSeries::stock_update)
                    .map(|update| (id.clone(), update))
            })
            .collect()
    }

    /// True when at least one instrument has a trade sample.
    #[must_use]
    pub fn has_samples(&self) -> bool {
        self.state.lock().series.values().any(InstrumentSeries::has_samples)
    }

    /// Metadata of one instrument: the series copy, else the directory entry, else empty.
    #[must_use]
    pub fn metadata(&self, id: &str) -> InstrumentMetadata {
        let state = self.state.lock();
        state
            .series
            .get(id)
            .map(|s| s.metadata.clone())
            .unwrap_or_else(|| state.metadata_for(id))
    }

    /// The current directory.
    #[must_use]
    pub fn all_metadata(&self) -> Directory {
        self.state.lock().directory.clone()
    }

    /// IDs with a series, sorted.
    #[must_use]
    pub fn instrument_ids(&self) -> Vec<InstrumentId> {
        self.state.lock().series.keys().cloned().collect()
    }

    /// Time of the last non-empty update.
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_update
    }

    /// Diagnostics view.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let samples: BTreeMap<_, _> = state
            .series
            .iter()
            .map(|(id, s)| (id.clone(), s.sample_counts()))
            .collect();
        let instruments_with_samples = samples.values().filter(|c| c.trade > 0).count();

        CacheStats {
            instrument_count: state.series.len(),
            instruments_with_samples,
            directory_size: state.directory.len(),
            last_update: state.last_update,
            samples,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::instrument::{
        BestLimitRecord, ClientTypeRecord, OrderBookLevels, TradeRecord,
    };

    fn trade(last: f64) -> TradeRecord {
        TradeRecord {
            last: Some(last),
            yesterday: Some(95.0),
            ..Default::default()
        }
    }

    fn snapshot_with_trades(ids: &[&str]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for id in ids {
            snapshot.trade.insert((*id).to_string(), trade(100.0));
        }
        snapshot
    }

    fn named(name: &str) -> InstrumentMetadata {
        InstrumentMetadata {
            name: Some(name.to_string()),
            valid: true,
            ..Default::default()
        }
    }

    #[test]
    fn update_creates_series_lazily() {
        let cache = MarketCache::new();

        let report = cache.update(&snapshot_with_trades(&["A", "B"]), None);

        assert_eq!(report.appended, 2);
        assert_eq!(report.created, 2);
        assert_eq!(cache.instrument_ids(), vec!["A".to_string(), "B".to_string()]);
        assert!(cache.last_update().is_some());
    }

    #[test]
    fn empty_snapshot_is_skipped() {
        let cache = MarketCache::new();
        let mut snapshot = Snapshot::default();
        snapshot
            .client_type
            .insert("A".into(), ClientTypeRecord::default());

        let report = cache.update(&snapshot, None);

        assert_eq!(report, UpdateReport::default());
        assert!(cache.last_update().is_none());
        assert!(!cache.has_samples());
    }

    #[test]
    fn client_type_only_appended_when_present() {
        let cache = MarketCache::new();
        let mut snapshot = snapshot_with_trades(&["A", "B"]);
        snapshot
            .client_type
            .insert("A".into(), ClientTypeRecord::default());

        cache.update(&snapshot, None);

        let a = cache.get("A").sample_counts();
        let b = cache.get("B").sample_counts();
        assert_eq!((a.trade, a.client_type, a.order_book), (1, 1, 1));
        assert_eq!((b.trade, b.client_type, b.order_book), (1, 0, 1));
    }

    #[test]
    fn order_book_levels_are_kept_by_number() {
        let cache = MarketCache::new();
        let mut snapshot = snapshot_with_trades(&["A"]);
        let mut levels = OrderBookLevels::new();
        levels.insert(1, BestLimitRecord {
            bid_price: Some(99.0),
            bid_quantity: Some(10.0),
            ..Default::default()
        });
        snapshot.limits.insert("A".into(), levels);

        cache.update(&snapshot, None);

        let summary = cache.summary();
        assert_eq!(summary["A"].pd1, Some(99.0));
        assert_eq!(summary["A"].qd1, Some(10.0));
        assert_eq!(summary["A"].po1, Some(0.0));
    }

    #[test]
    fn unknown_id_returns_empty_series() {
        let cache = MarketCache::new();

        let series = cache.get("unknown");

        assert_eq!(series, InstrumentSeries::default());
        assert_eq!(cache.metadata("unknown"), InstrumentMetadata::default());
    }

    #[test]
    fn metadata_replacement_patches_existing_series() {
        let cache = MarketCache::new();
        cache.update(&snapshot_with_trades(&["A"]), None);

        let directory: Directory = [("A".to_string(), named("FOLD"))].into_iter().collect();
        let report = cache.update(&Snapshot::default(), Some(directory));

        assert!(report.metadata_replaced);
        assert_eq!(cache.get("A").metadata.name.as_deref(), Some("FOLD"));
        assert_eq!(cache.all_metadata().len(), 1);
    }

    #[test]
    fn metadata_replacement_is_wholesale() {
        let cache = MarketCache::new();
        let first: Directory = [
            ("A".to_string(), named("FOLD")),
            ("B".to_string(), named("KHODRO")),
        ]
        .into_iter()
        .collect();
        cache.update(&snapshot_with_trades(&["A", "B"]), Some(first));

        let second: Directory = [("A".to_string(), named("FOLD2"))].into_iter().collect();
        cache.update(&Snapshot::default(), Some(second));

        assert_eq!(cache.metadata("A").name.as_deref(), Some("FOLD2"));
        assert_eq!(cache.metadata("B"), InstrumentMetadata::default());
        assert!(!cache.all_metadata().contains_key("B"));
    }

    #[test]
    fn new_series_receive_directory_entry() {
        let cache = MarketCache::new();
        let directory: Directory = [("A".to_string(), named("FOLD"))].into_iter().collect();

        cache.update(&snapshot_with_trades(&["A"]), Some(directory));

        assert_eq!(cache.get("A").metadata.name.as_deref(), Some("FOLD"));
    }

    #[test]
    fn metadata_falls_back_to_directory() {
        let cache = MarketCache::new();
        let directory: Directory = [("Z".to_string(), named("NOSERIES"))].into_iter().collect();

        cache.update(&Snapshot::default(), Some(directory));

        assert_eq!(cache.metadata("Z").name.as_deref(), Some("NOSERIES"));
    }

    #[test]
    fn latest_skips_ids_without_samples() {
        let cache = MarketCache::new();
        cache.update(&snapshot_with_trades(&["A"]), None);

        let ids = vec!["A".to_string(), "missing".to_string()];
        let latest = cache.latest(&ids);

        assert_eq!(latest.len(), 1);
        assert_eq!(latest["A"].price.last, Some(100.0));
    }

    #[test]
    fn stats_report_sample_counts() {
        let cache = MarketCache::new();
        cache.update(&snapshot_with_trades(&["A"]), None);
        cache.update(&snapshot_with_trades(&["A", "B"]), None);

        let stats = cache.stats();

        assert_eq!(stats.instrument_count, 2);
        assert_eq!(stats.instruments_with_samples, 2);
        assert_eq!(stats.samples["A"].trade, 2);
        assert_eq!(stats.samples["B"].order_book, 1);
    }

    #[derive(Debug)]
    struct KeepLast(usize);

    impl RetentionPolicy for KeepLast {
        fn apply(&self, _id: &str, series: &mut InstrumentSeries) {
            series.trade.retain_last(self.0);
        }
    }

    #[test]
    fn retention_policy_runs_after_append() {
        let cache = MarketCache::with_retention(Box::new(KeepLast(2)));

        for _ in 0..5 {
            cache.update(&snapshot_with_trades(&["A"]), None);
        }

        let series = cache.get("A");
        assert_eq!(series.trade.time.len(), 2);
        assert_eq!(series.trade.pl.len(), 2);
        assert_eq!(series.trade.tval.len(), 2);
        assert_eq!(series.trade.pmin.len(), 2);
    }

    #[test]
    fn concurrent_readers_see_whole_groups() {
        let cache = Arc::new(MarketCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    cache.update(&snapshot_with_trades(&["A", "B", "C"]), None);
                }
            })
        };

        for _ in 0..200 {
            for series in cache.get_all().values() {
                let t = &series.trade;
                assert_eq!(t.time.len(), t.pl.len());
                assert_eq!(t.pl.len(), t.tval.len());
                assert_eq!(t.len(), series.order_book.len());
            }
        }

        writer.join().unwrap();
        assert_eq!(cache.get("C").trade.len(), 200);
    }
}
