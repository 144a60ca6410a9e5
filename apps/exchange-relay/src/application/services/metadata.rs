//! Metadata Resolver
//!
//! Owns the instrument directory: which instruments exist, which are valid,
//! and their descriptive and valuation fields. Refreshes at most once per
//! local calendar day in the exchange's timezone, after a cutover time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use parking_lot::RwLock;

use crate::application::ports::{DirectorySource, FetchError, RawDirectory};
use crate::domain::instrument::{Directory, InstrumentId, InstrumentMetadata};
use crate::infrastructure::metrics::{self, SourceCall};

// =============================================================================
// Refresh Schedule
// =============================================================================

/// When a directory refresh is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// Reference timezone of the exchange.
    pub offset: FixedOffset,
    /// Local time from which a new day's refresh may run.
    pub cutover: NaiveTime,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(210 * 60).unwrap_or_else(|| Utc.fix()),
            cutover: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl RefreshSchedule {
    /// Whether a refresh is due at `now` given the last successful refresh.
    ///
    /// Due when never refreshed, or when the local date is strictly after the
    /// local date of the last refresh and the local time is at or past the cutover.
    #[must_use]
    pub fn is_due(&self, last_refresh: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_refresh else {
            return true;
        };

        let local_now = now.with_timezone(&self.offset);
        let last_date = last.with_timezone(&self.offset).date_naive();

        local_now.date_naive() > last_date && local_now.time() >= self.cutover
    }
}

// =============================================================================
// Resolver
// =============================================================================

#[derive(Debug, Default)]
struct ResolverState {
    directory: Directory,
    last_refresh: Option<DateTime<Utc>>,
}

/// Authoritative instrument directory with a daily refresh cadence.
pub struct MetadataResolver {
    source: Arc<dyn DirectorySource>,
    schedule: RefreshSchedule,
    state: RwLock<ResolverState>,
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MetadataResolver")
            .field("schedule", &self.schedule)
            .field("entries", &state.directory.len())
            .field("last_refresh", &state.last_refresh)
            .finish_non_exhaustive()
    }
}

impl MetadataResolver {
    /// Create a resolver with an empty directory.
    #[must_use]
    pub fn new(source: Arc<dyn DirectorySource>, schedule: RefreshSchedule) -> Self {
        Self {
            source,
            schedule,
            state: RwLock::new(ResolverState::default()),
        }
    }

    /// Refresh the directory if due (or forced).
    ///
    /// Returns the new valid-instrument directory when a refresh succeeded,
    /// `None` when nothing was refreshed.
    pub async fn refresh_if_due(&self, force: bool) -> Option<Directory> {
        self.refresh_if_due_at(force, Utc::now()).await
    }

    /// [`Self::refresh_if_due`] against an explicit clock.
    pub async fn refresh_if_due_at(&self, force: bool, now: DateTime<Utc>) -> Option<Directory> {
        if !force && !self.schedule.is_due(self.last_refresh(), now) {
            return None;
        }

        tracing::info!(force, "Refreshing instrument directory");

        let (listing, daily, statics) = tokio::join!(
            self.source.fetch_listing(),
            self.source.fetch_daily_details(),
            self.source.fetch_static_details(),
        );

        let listing = match listing {
            Ok(listing) if !listing.is_empty() => listing,
            Ok(_) => {
                tracing::warn!("Directory listing is empty, keeping previous directory");
                metrics::record_metadata_refresh(false);
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Directory listing failed, keeping previous directory");
                metrics::record_source_failure(SourceCall::Listing);
                metrics::record_metadata_refresh(false);
                return None;
            }
        };
        let daily = degrade(daily, SourceCall::DailyDetails);
        let statics = degrade(statics, SourceCall::StaticDetails);

        let directory: Directory = listing
            .iter()
            .map(|(id, record)| {
                let merged = InstrumentMetadata::merge(record, daily.get(id), statics.get(id));
                (id.clone(), merged)
            })
            .collect();

        let valid = {
            let mut state = self.state.write();
            state.directory = directory;
            state.last_refresh = Some(now);
            valid_entries(&state.directory)
        };

        metrics::record_metadata_refresh(true);
        tracing::info!(
            listed = listing.len(),
            valid = valid.len(),
            daily = daily.len(),
            statics = statics.len(),
            "Instrument directory refreshed"
        );

        Some(valid)
    }

    /// IDs of every instrument flagged valid.
    #[must_use]
    pub fn valid_ids(&self) -> HashSet<InstrumentId> {
        self.state
            .read()
            .directory
            .iter()
            .filter(|(_, meta)| meta.valid)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Metadata of one instrument, or an empty record.
    #[must_use]
    pub fn simplified(&self, id: &str) -> InstrumentMetadata {
        self.state
            .read()
            .directory
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every valid instrument's metadata.
    #[must_use]
    pub fn all(&self) -> Directory {
        valid_entries(&self.state.read().directory)
    }

    /// Every listed instrument ID, valid or not, sorted.
    #[must_use]
    pub fn stock_ids(&self) -> Vec<InstrumentId> {
        let mut ids: Vec<_> = self.state.read().directory.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Time of the last successful refresh.
    #[must_use]
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_refresh
    }
}

fn valid_entries(directory: &Directory) -> Directory {
    directory
        .iter()
        .filter(|(_, meta)| meta.valid)
        .map(|(id, meta)| (id.clone(), meta.clone()))
        .collect()
}

fn degrade(result: Result<RawDirectory, FetchError>, call: SourceCall) -> RawDirectory {
    result.unwrap_or_else(|e| {
        tracing::warn!(call = call.as_str(), error = %e, "Directory detail source failed");
        metrics::record_source_failure(call);
        RawDirectory::new()
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    struct FakeDirectory {
        listing: Mutex<Result<RawDirectory, FetchError>>,
        daily: Result<RawDirectory, FetchError>,
        listing_calls: AtomicUsize,
    }

    impl FakeDirectory {
        fn new(listing: serde_json::Value) -> Self {
            Self {
                listing: Mutex::new(Ok(raw(listing))),
                daily: Ok(RawDirectory::new()),
                listing_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DirectorySource for FakeDirectory {
        async fn fetch_listing(&self) -> Result<RawDirectory, FetchError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            self.listing.lock().clone()
        }

        async fn fetch_daily_details(&self) -> Result<RawDirectory, FetchError> {
            self.daily.clone()
        }

        async fn fetch_static_details(&self) -> Result<RawDirectory, FetchError> {
            Err(FetchError::Transport {
                message: "unreachable".into(),
            })
        }
    }

    fn raw(value: serde_json::Value) -> RawDirectory {
        value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_object().cloned().unwrap()))
            .collect()
    }

    fn two_instruments() -> serde_json::Value {
        json!({
            "A": {"name": "FOLD", "valid": "1"},
            "B": {"name": "DELISTED", "valid": "0"},
        })
    }

    fn tehran(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        RefreshSchedule::default()
            .offset
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test_case(None, tehran(2026, 3, 1, 3, 0), true ; "never refreshed")]
    #[test_case(Some(tehran(2026, 3, 1, 9, 0)), tehran(2026, 3, 1, 23, 0), false ; "same day")]
    #[test_case(Some(tehran(2026, 3, 1, 9, 0)), tehran(2026, 3, 2, 7, 59), false ; "next day before cutover")]
    #[test_case(Some(tehran(2026, 3, 1, 9, 0)), tehran(2026, 3, 2, 8, 0), true ; "next day at cutover")]
    #[test_case(Some(tehran(2026, 3, 1, 23, 50)), tehran(2026, 3, 5, 12, 0), true ; "days later")]
    fn schedule_is_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, expected: bool) {
        assert_eq!(RefreshSchedule::default().is_due(last, now), expected);
    }

    #[test]
    fn schedule_uses_local_date_not_utc_date() {
        // 21:00 UTC on the 1st is 00:30 local on the 2nd.
        let last = tehran(2026, 3, 1, 10, 0);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 21, 0, 0).unwrap();

        assert!(!RefreshSchedule::default().is_due(Some(last), now));
    }

    #[tokio::test]
    async fn first_refresh_loads_directory() {
        let source = Arc::new(FakeDirectory::new(two_instruments()));
        let resolver = MetadataResolver::new(source, RefreshSchedule::default());

        let directory = resolver.refresh_if_due(false).await.unwrap();

        assert_eq!(directory.len(), 1);
        assert!(directory.contains_key("A"));
        assert_eq!(resolver.stock_ids(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(resolver.valid_ids().len(), 1);
        assert_eq!(resolver.simplified("A").name.as_deref(), Some("FOLD"));
        assert_eq!(resolver.simplified("nope"), InstrumentMetadata::default());
        assert!(resolver.last_refresh().is_some());
    }

    #[tokio::test]
    async fn refresh_not_repeated_within_the_day() {
        let source = Arc::new(FakeDirectory::new(two_instruments()));
        let resolver = MetadataResolver::new(source.clone(), RefreshSchedule::default());

        resolver
            .refresh_if_due_at(false, tehran(2026, 3, 1, 9, 0))
            .await
            .unwrap();
        let again = resolver
            .refresh_if_due_at(false, tehran(2026, 3, 1, 15, 0))
            .await;

        assert!(again.is_none());
        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_ignores_schedule() {
        let source = Arc::new(FakeDirectory::new(two_instruments()));
        let resolver = MetadataResolver::new(source.clone(), RefreshSchedule::default());

        resolver.refresh_if_due(false).await.unwrap();
        let forced = resolver.refresh_if_due(true).await;

        assert!(forced.is_some());
        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_listing_keeps_previous_directory() {
        let source = Arc::new(FakeDirectory::new(two_instruments()));
        let resolver = MetadataResolver::new(source.clone(), RefreshSchedule::default());
        resolver.refresh_if_due(false).await.unwrap();
        let first_refresh = resolver.last_refresh();

        *source.listing.lock() = Err(FetchError::Status {
            status: 502,
            body: "bad gateway".into(),
        });
        let result = resolver.refresh_if_due(true).await;

        assert!(result.is_none());
        assert_eq!(resolver.valid_ids().len(), 1);
        assert_eq!(resolver.last_refresh(), first_refresh);
    }

    #[tokio::test]
    async fn empty_listing_does_not_count_as_refresh() {
        let source = Arc::new(FakeDirectory::new(json!({})));
        let resolver = MetadataResolver::new(source, RefreshSchedule::default());

        assert!(resolver.refresh_if_due(false).await.is_none());
        assert!(resolver.last_refresh().is_none());
        assert!(resolver.valid_ids().is_empty());
    }

    #[tokio::test]
    async fn daily_details_merged_and_failed_statics_degrade() {
        let mut source = FakeDirectory::new(two_instruments());
        source.daily = Ok(raw(json!({"A": {"pe": "7.5", "tmax": 1100}})));
        let resolver = MetadataResolver::new(Arc::new(source), RefreshSchedule::default());

        let directory = resolver.refresh_if_due(false).await.unwrap();

        let a = &directory["A"];
        assert_eq!(a.pe, Some(7.5));
        assert_eq!(a.tmax, Some(1100.0));
        assert_eq!(a.tmin, None);
        assert!(a.flags.is_empty());
    }
}
