//! Fetcher
//!
//! Runs the poll cycle: refresh the directory if due, pull one snapshot from
//! every upstream call concurrently, filter it to valid instruments, and hand
//! it to the cache. A failed call degrades to an empty result for that call
//! only; a cycle never fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backoff::{RetryConfig, RetryPolicy};
use super::cache::{MarketCache, UpdateReport};
use super::metadata::MetadataResolver;
use crate::application::ports::{FetchError, Flow, SnapshotSource};
use crate::domain::instrument::{InstrumentId, Snapshot, SnapshotCounts};
use crate::infrastructure::metrics::{self, SourceCall};

/// Market flows queried by default.
pub const DEFAULT_FLOWS: [Flow; 4] = [1, 2, 4, 7];

// =============================================================================
// Configuration
// =============================================================================

/// Fetch loop configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Market flows to query for trades and best limits.
    pub flows: Vec<Flow>,
    /// Interval between cycles that produced data.
    pub poll_interval: Duration,
    /// Backoff used after a cycle that produced nothing.
    pub empty_retry: RetryConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(60);
        Self {
            flows: DEFAULT_FLOWS.to_vec(),
            poll_interval,
            empty_retry: RetryConfig::for_fetch_loop(Duration::from_secs(5), poll_interval),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Record counts of the filtered snapshot.
    pub counts: SnapshotCounts,
    /// Upstream calls that failed.
    pub failed_calls: usize,
    /// Whether the directory was refreshed this cycle.
    pub metadata_refreshed: bool,
    /// What the cache did with the snapshot.
    pub update: UpdateReport,
}

impl CycleReport {
    /// True when the snapshot carried no data at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.counts.client_type == 0 && self.counts.trade == 0 && self.counts.limits == 0
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Single writer of the market cache.
pub struct Fetcher {
    source: Arc<dyn SnapshotSource>,
    resolver: Arc<MetadataResolver>,
    cache: Arc<MarketCache>,
    config: FetcherConfig,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a fetcher.
    #[must_use]
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        resolver: Arc<MetadataResolver>,
        cache: Arc<MarketCache>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            source,
            resolver,
            cache,
            config,
        }
    }

    /// Pull one snapshot from every upstream call and filter it to valid instruments.
    pub async fn poll(&self) -> Snapshot {
        self.poll_counting_failures().await.0
    }

    async fn poll_counting_failures(&self) -> (Snapshot, usize) {
        let flows = &self.config.flows;

        let (client_type, trades, limits) = tokio::join!(
            self.source.fetch_client_type(),
            join_all(flows.iter().map(|&flow| self.source.fetch_trades(flow))),
            join_all(flows.iter().map(|&flow| self.source.fetch_best_limits(flow))),
        );

        let mut failed = 0;
        let mut snapshot = Snapshot {
            client_type: settle(client_type, SourceCall::ClientType, None, &mut failed),
            ..Snapshot::default()
        };
        for (&flow, result) in flows.iter().zip(trades) {
            snapshot
                .trade
                .extend(settle(result, SourceCall::Trades, Some(flow), &mut failed));
        }
        for (&flow, result) in flows.iter().zip(limits) {
            snapshot
                .limits
                .extend(settle(result, SourceCall::BestLimits, Some(flow), &mut failed));
        }

        let valid_ids = self.resolver.valid_ids();
        if valid_ids.is_empty() {
            tracing::warn!("No instrument directory loaded yet, snapshot passes unfiltered");
        } else {
            snapshot.retain_ids(&valid_ids);
        }

        (snapshot, failed)
    }

    /// Run one full cycle: directory refresh, poll, cache update.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();

        let metadata = self.resolver.refresh_if_due(false).await;
        let metadata_refreshed = metadata.is_some();
        let (snapshot, failed_calls) = self.poll_counting_failures().await;
        let counts = snapshot.counts();
        let update = self.cache.update(&snapshot, metadata);

        let report = CycleReport {
            counts,
            failed_calls,
            metadata_refreshed,
            update,
        };
        metrics::record_fetch_cycle(started.elapsed(), report.is_empty());

        tracing::info!(
            trade = counts.trade,
            client_type = counts.client_type,
            limits = counts.limits,
            failed_calls,
            metadata_refreshed,
            elapsed_ms = started.elapsed().as_millis(),
            "Fetch cycle complete"
        );
        report
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// Cycles are sequential and never overlap. After an empty cycle the next
    /// one starts after a short backoff instead of the full poll interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut retry = RetryPolicy::new(self.config.empty_retry.clone());
        let mut cycle: u64 = 0;

        tracing::info!(
            flows = ?self.config.flows,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Fetcher started"
        );

        loop {
            cycle += 1;
            let span = tracing::info_span!("fetch_cycle", cycle);

            let report = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                report = self.run_cycle().instrument(span) => report,
            };

            let delay = if report.is_empty() {
                let delay = retry.next_delay();
                tracing::warn!(
                    attempt = retry.attempt_count(),
                    delay_ms = delay.as_millis(),
                    "Fetch cycle returned no data, retrying early"
                );
                delay
            } else {
                retry.reset();
                self.config.poll_interval
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(cycles = cycle, "Fetcher stopped");
    }
}

fn settle<V>(
    result: Result<HashMap<InstrumentId, V>, FetchError>,
    call: SourceCall,
    flow: Option<Flow>,
    failed: &mut usize,
) -> HashMap<InstrumentId, V> {
    result.unwrap_or_else(|e| {
        *failed += 1;
        metrics::record_source_failure(call);
        tracing::warn!(
            call = call.as_str(),
            flow,
            transient = e.is_transient(),
            error = %e,
            "Upstream call failed, using empty result"
        );
        HashMap::new()
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use serde_json::json;

    use super::*;
    use crate::application::ports::{MockDirectorySource, MockSnapshotSource, RawDirectory};
    use crate::application::services::metadata::RefreshSchedule;
    use crate::domain::instrument::{
        BestLimitRecord, ClientTypeRecord, OrderBookLevels, TradeRecord,
    };

    fn trade(last: f64) -> TradeRecord {
        TradeRecord {
            last: Some(last),
            ..Default::default()
        }
    }

    fn trades(entries: &[(&str, f64)]) -> HashMap<InstrumentId, TradeRecord> {
        entries
            .iter()
            .map(|(id, last)| ((*id).to_string(), trade(*last)))
            .collect()
    }

    fn directory(valid: &[&str]) -> MockDirectorySource {
        let listing: RawDirectory = valid
            .iter()
            .map(|id| {
                let record = json!({"name": id, "valid": "1"});
                ((*id).to_string(), record.as_object().cloned().unwrap())
            })
            .collect();

        let mut source = MockDirectorySource::new();
        source
            .expect_fetch_listing()
            .returning(move || Ok(listing.clone()));
        source
            .expect_fetch_daily_details()
            .returning(|| Ok(RawDirectory::new()));
        source
            .expect_fetch_static_details()
            .returning(|| Ok(RawDirectory::new()));
        source
    }

    fn fetcher(source: MockSnapshotSource, dir: MockDirectorySource, flows: Vec<Flow>) -> Fetcher {
        fetcher_with(source, dir, FetcherConfig {
            flows,
            ..FetcherConfig::default()
        })
    }

    fn fetcher_with(
        source: MockSnapshotSource,
        dir: MockDirectorySource,
        config: FetcherConfig,
    ) -> Fetcher {
        let resolver = Arc::new(MetadataResolver::new(Arc::new(dir), RefreshSchedule::default()));
        Fetcher::new(Arc::new(source), resolver, Arc::new(MarketCache::new()), config)
    }

    #[tokio::test]
    async fn poll_calls_every_flow_once() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch_client_type()
            .times(1)
            .returning(|| Ok(HashMap::new()));
        for flow in DEFAULT_FLOWS {
            source
                .expect_fetch_trades()
                .with(eq(flow))
                .times(1)
                .returning(|_| Ok(HashMap::new()));
            source
                .expect_fetch_best_limits()
                .with(eq(flow))
                .times(1)
                .returning(|_| Ok(HashMap::new()));
        }

        let fetcher = fetcher(source, MockDirectorySource::new(), DEFAULT_FLOWS.to_vec());
        let snapshot = fetcher.poll().await;

        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn later_flow_wins_on_conflict() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch_client_type()
            .returning(|| Ok(HashMap::new()));
        source
            .expect_fetch_trades()
            .with(eq(1))
            .returning(|_| Ok(trades(&[("A", 100.0), ("B", 50.0)])));
        source
            .expect_fetch_trades()
            .with(eq(2))
            .returning(|_| Ok(trades(&[("A", 101.0)])));
        source
            .expect_fetch_best_limits()
            .returning(|_| Ok(HashMap::new()));

        let fetcher = fetcher(source, MockDirectorySource::new(), vec![1, 2]);
        let snapshot = fetcher.poll().await;

        assert_eq!(snapshot.trade["A"].last, Some(101.0));
        assert_eq!(snapshot.trade["B"].last, Some(50.0));
    }

    #[tokio::test]
    async fn failed_call_degrades_to_empty() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch_client_type().returning(|| {
            Err(FetchError::Transport {
                message: "timed out".into(),
            })
        });
        source
            .expect_fetch_trades()
            .with(eq(1))
            .returning(|_| Ok(trades(&[("A", 100.0)])));
        source.expect_fetch_trades().with(eq(2)).returning(|_| {
            Err(FetchError::Status {
                status: 500,
                body: String::new(),
            })
        });
        source
            .expect_fetch_best_limits()
            .returning(|_| Ok(HashMap::new()));

        let fetcher = fetcher(source, MockDirectorySource::new(), vec![1, 2]);
        let (snapshot, failed) = fetcher.poll_counting_failures().await;

        assert_eq!(failed, 2);
        assert!(snapshot.client_type.is_empty());
        assert_eq!(snapshot.trade.len(), 1);
    }

    #[tokio::test]
    async fn cycle_filters_to_valid_ids_and_updates_cache() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch_client_type().returning(|| {
            Ok([
                ("A".to_string(), ClientTypeRecord::default()),
                ("X".to_string(), ClientTypeRecord::default()),
            ]
            .into_iter()
            .collect())
        });
        source
            .expect_fetch_trades()
            .returning(|_| Ok(trades(&[("A", 100.0), ("X", 1.0)])));
        source.expect_fetch_best_limits().returning(|_| {
            let mut levels = OrderBookLevels::new();
            levels.insert(1, BestLimitRecord::default());
            Ok([("X".to_string(), levels)].into_iter().collect())
        });

        let fetcher = fetcher(source, directory(&["A"]), vec![1]);
        let report = fetcher.run_cycle().await;

        assert!(report.metadata_refreshed);
        assert_eq!(report.counts.trade, 1);
        assert_eq!(report.counts.client_type, 1);
        assert_eq!(report.counts.limits, 0);
        assert_eq!(report.update.appended, 1);
        assert_eq!(fetcher.cache.instrument_ids(), vec!["A".to_string()]);
        assert_eq!(fetcher.cache.get("A").metadata.name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn unfiltered_without_directory() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch_client_type()
            .returning(|| Ok(HashMap::new()));
        source
            .expect_fetch_trades()
            .returning(|_| Ok(trades(&[("A", 100.0), ("B", 1.0)])));
        source
            .expect_fetch_best_limits()
            .returning(|_| Ok(HashMap::new()));
        let mut dir = MockDirectorySource::new();
        dir.expect_fetch_listing()
            .returning(|| Ok(RawDirectory::new()));
        dir.expect_fetch_daily_details()
            .returning(|| Ok(RawDirectory::new()));
        dir.expect_fetch_static_details()
            .returning(|| Ok(RawDirectory::new()));

        let fetcher = fetcher(source, dir, vec![1]);
        let report = fetcher.run_cycle().await;

        assert!(!report.metadata_refreshed);
        assert_eq!(report.update.appended, 2);
    }

    #[tokio::test]
    async fn run_repeats_until_shutdown() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch_client_type()
            .returning(|| Ok(HashMap::new()));
        source
            .expect_fetch_trades()
            .returning(|_| Ok(trades(&[("A", 100.0)])));
        source
            .expect_fetch_best_limits()
            .returning(|_| Ok(HashMap::new()));

        let config = FetcherConfig {
            flows: vec![1],
            poll_interval: Duration::from_millis(20),
            ..FetcherConfig::default()
        };
        let fetcher = Arc::new(fetcher_with(source, directory(&["A"]), config));
        let shutdown = CancellationToken::new();
        let handle = {
            let fetcher = Arc::clone(&fetcher);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { fetcher.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let cycles = fetcher.cache.get("A").trade.len();
        assert!(cycles >= 2, "expected repeated cycles, got {cycles}");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fetcher.cache.get("A").trade.len(), cycles);
    }

    #[test]
    fn empty_report() {
        assert!(CycleReport::default().is_empty());
        let report = CycleReport {
            counts: SnapshotCounts {
                trade: 1,
                ..SnapshotCounts::default()
            },
            ..CycleReport::default()
        };
        assert!(!report.is_empty());
    }
}
