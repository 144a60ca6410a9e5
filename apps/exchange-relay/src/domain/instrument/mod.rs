//! Instrument Types
//!
//! Domain types for one poll cycle of exchange data (trade, client-type,
//! best-limit records) and the slow-changing instrument directory.
//!
//! Field names on the wire follow the exchange's column names
//! (`PDrCotVal`, `Buy_I_Volume`, `ZOrdMeDem`, ...). Numeric columns are
//! accepted as JSON numbers or numeric strings; anything else is treated
//! as absent.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// =============================================================================
// Types
// =============================================================================

/// Exchange instrument code (`InsCode`).
pub type InstrumentId = String;

/// Untyped record as returned by a directory source, keyed by column name.
pub type RawRecord = serde_json::Map<String, Value>;

/// Number of order-book levels per side.
pub const ORDER_BOOK_DEPTH: usize = 5;

/// Best-limit records of one instrument, keyed by level number (1..=5).
pub type OrderBookLevels = BTreeMap<u8, BestLimitRecord>;

/// Instrument directory: ID to metadata.
pub type Directory = HashMap<InstrumentId, InstrumentMetadata>;

// =============================================================================
// Lenient Wire Values
// =============================================================================

/// Interpret a JSON value as a float.
///
/// Numbers pass through, numeric strings are parsed, everything else is `None`.
#[must_use]
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Interpret a JSON value as a non-empty string.
#[must_use]
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_f64))
}

// =============================================================================
// Snapshot Records
// =============================================================================

/// Trade-core columns for one instrument in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TradeRecord {
    /// Last traded price.
    #[serde(rename = "PDrCotVal", default, deserialize_with = "lenient_f64")]
    pub last: Option<f64>,
    /// Closing price.
    #[serde(rename = "PClosing", default, deserialize_with = "lenient_f64")]
    pub closing: Option<f64>,
    /// Opening price.
    #[serde(rename = "PriceFirst", default, deserialize_with = "lenient_f64")]
    pub first: Option<f64>,
    /// Previous session close.
    #[serde(rename = "PriceYesterday", default, deserialize_with = "lenient_f64")]
    pub yesterday: Option<f64>,
    /// Session high.
    #[serde(rename = "PriceMax", default, deserialize_with = "lenient_f64")]
    pub max: Option<f64>,
    /// Session low.
    #[serde(rename = "PriceMin", default, deserialize_with = "lenient_f64")]
    pub min: Option<f64>,
    /// Number of transactions.
    #[serde(rename = "ZTotTran", default, deserialize_with = "lenient_f64")]
    pub transactions: Option<f64>,
    /// Traded volume.
    #[serde(rename = "QTotTran5J", default, deserialize_with = "lenient_f64")]
    pub volume: Option<f64>,
    /// Traded value.
    #[serde(rename = "QTotCap", default, deserialize_with = "lenient_f64")]
    pub value: Option<f64>,
}

/// Client-type columns (legal vs natural investors) for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientTypeRecord {
    /// Buy volume by legal investors.
    #[serde(rename = "Buy_I_Volume", default, deserialize_with = "lenient_f64")]
    pub buy_legal_volume: Option<f64>,
    /// Buy volume by natural investors.
    #[serde(rename = "Buy_N_Volume", default, deserialize_with = "lenient_f64")]
    pub buy_natural_volume: Option<f64>,
    /// Sell volume by legal investors.
    #[serde(rename = "Sell_I_Volume", default, deserialize_with = "lenient_f64")]
    pub sell_legal_volume: Option<f64>,
    /// Sell volume by natural investors.
    #[serde(rename = "Sell_N_Volume", default, deserialize_with = "lenient_f64")]
    pub sell_natural_volume: Option<f64>,
    /// Buyer count, legal.
    #[serde(rename = "Buy_CountI", default, deserialize_with = "lenient_f64")]
    pub buy_legal_count: Option<f64>,
    /// Buyer count, natural.
    #[serde(rename = "Buy_CountN", default, deserialize_with = "lenient_f64")]
    pub buy_natural_count: Option<f64>,
    /// Seller count, legal.
    #[serde(rename = "Sell_CountI", default, deserialize_with = "lenient_f64")]
    pub sell_legal_count: Option<f64>,
    /// Seller count, natural.
    #[serde(rename = "Sell_CountN", default, deserialize_with = "lenient_f64")]
    pub sell_natural_count: Option<f64>,
}

/// One order-book level (bid and ask side) for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BestLimitRecord {
    /// Number of bid orders.
    #[serde(rename = "ZOrdMeDem", default, deserialize_with = "lenient_f64")]
    pub bid_orders: Option<f64>,
    /// Bid quantity.
    #[serde(rename = "QTitMeDem", default, deserialize_with = "lenient_f64")]
    pub bid_quantity: Option<f64>,
    /// Bid price.
    #[serde(rename = "PMeDem", default, deserialize_with = "lenient_f64")]
    pub bid_price: Option<f64>,
    /// Ask price.
    #[serde(rename = "PMeOf", default, deserialize_with = "lenient_f64")]
    pub ask_price: Option<f64>,
    /// Ask quantity.
    #[serde(rename = "QTitMeOf", default, deserialize_with = "lenient_f64")]
    pub ask_quantity: Option<f64>,
    /// Number of ask orders.
    #[serde(rename = "ZOrdMeOf", default, deserialize_with = "lenient_f64")]
    pub ask_orders: Option<f64>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// One best-effort pull of exchange data across the instrument universe.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Client-type records by instrument.
    pub client_type: HashMap<InstrumentId, ClientTypeRecord>,
    /// Trade records by instrument.
    pub trade: HashMap<InstrumentId, TradeRecord>,
    /// Order-book levels by instrument.
    pub limits: HashMap<InstrumentId, OrderBookLevels>,
}

impl Snapshot {
    /// True when no call produced any data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.client_type.is_empty() && self.trade.is_empty() && self.limits.is_empty()
    }

    /// Drop every record whose instrument is not in `ids`.
    pub fn retain_ids(&mut self, ids: &HashSet<InstrumentId>) {
        self.client_type.retain(|id, _| ids.contains(id));
        self.trade.retain(|id, _| ids.contains(id));
        self.limits.retain(|id, _| ids.contains(id));
    }

    /// Record counts per group, for logging.
    #[must_use]
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            client_type: self.client_type.len(),
            trade: self.trade.len(),
            limits: self.limits.len(),
        }
    }
}

/// Record counts of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    /// Instruments with client-type data.
    pub client_type: usize,
    /// Instruments with trade data.
    pub trade: usize,
    /// Instruments with order-book data.
    pub limits: usize,
}

// =============================================================================
// Metadata
// =============================================================================

/// Descriptive and valuation fields of one instrument.
///
/// Every field degrades to `None` when its source did not provide it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    /// Ticker-style display name.
    pub name: Option<String>,
    /// Full company name.
    #[serde(rename = "Full_name")]
    pub full_name: Option<String>,
    /// Board (market group) code.
    #[serde(rename = "CGrValCot")]
    pub board_code: Option<String>,
    /// Industry sector number.
    pub industry_num: Option<String>,
    /// Industry sector name.
    pub industry_name: Option<String>,
    /// Exchange code.
    #[serde(rename = "Exchange")]
    pub exchange: Option<String>,
    /// Exchange name.
    pub exchange_name: Option<String>,
    /// Whether the instrument is currently listed as valid.
    pub valid: bool,
    /// Price-to-earnings ratio.
    pub pe: Option<f64>,
    /// Upper daily price bound.
    pub tmax: Option<f64>,
    /// Lower daily price bound.
    pub tmin: Option<f64>,
    /// Net asset value (funds).
    pub nav: Option<f64>,
    /// Static flags not covered above.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, Value>,
}

/// Columns taken from the directory listing.
const LISTING_FIELDS: &[&str] = &[
    "name",
    "Full_name",
    "CGrValCot",
    "industry_num",
    "industry_name",
    "Exchange",
    "exchange_name",
    "valid",
];

impl InstrumentMetadata {
    /// Merge one instrument's records from the three directory sources.
    ///
    /// The listing supplies descriptive fields, the daily detail supplies
    /// valuation fields, and whatever else the static detail carries is
    /// kept as flags. Valuation fields fall back to the listing when the
    /// daily detail is missing them.
    #[must_use]
    pub fn merge(
        listing: &RawRecord,
        daily: Option<&RawRecord>,
        static_detail: Option<&RawRecord>,
    ) -> Self {
        let text = |key: &str| listing.get(key).and_then(value_as_string);
        let number = |key: &str| {
            daily
                .and_then(|d| d.get(key))
                .or_else(|| listing.get(key))
                .and_then(value_as_f64)
        };

        let flags = static_detail
            .map(|s| {
                s.iter()
                    .filter(|(k, _)| !LISTING_FIELDS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: text("name"),
            full_name: text("Full_name"),
            board_code: text("CGrValCot"),
            industry_num: text("industry_num"),
            industry_name: text("industry_name"),
            exchange: text("Exchange"),
            exchange_name: text("exchange_name"),
            valid: listing.get("valid").is_some_and(is_truthy),
            pe: number("pe"),
            tmax: number("tmax"),
            tmin: number("tmin"),
            nav: number("nav"),
            flags,
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim(), "1" | "true" | "True"),
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn trade_record_accepts_numbers_and_strings() {
        let rec: TradeRecord = serde_json::from_value(json!({
            "PDrCotVal": 100,
            "PClosing": "99.5",
            "PriceMax": null,
            "PriceMin": "n/a",
        }))
        .unwrap();

        assert_eq!(rec.last, Some(100.0));
        assert_eq!(rec.closing, Some(99.5));
        assert_eq!(rec.max, None);
        assert_eq!(rec.min, None);
        assert_eq!(rec.volume, None);
    }

    #[test]
    fn best_limit_record_ignores_unknown_columns() {
        let rec: BestLimitRecord = serde_json::from_value(json!({
            "InsCode": "123",
            "number": "1",
            "PMeDem": "1200",
            "QTitMeDem": 500,
        }))
        .unwrap();

        assert_eq!(rec.bid_price, Some(1200.0));
        assert_eq!(rec.bid_quantity, Some(500.0));
        assert_eq!(rec.ask_price, None);
    }

    #[test]
    fn snapshot_retain_ids_filters_every_group() {
        let mut snapshot = Snapshot::default();
        snapshot.trade.insert("A".into(), TradeRecord::default());
        snapshot.trade.insert("B".into(), TradeRecord::default());
        snapshot
            .client_type
            .insert("B".into(), ClientTypeRecord::default());
        snapshot.limits.insert("C".into(), OrderBookLevels::new());

        let ids: HashSet<InstrumentId> = ["A".to_string()].into_iter().collect();
        snapshot.retain_ids(&ids);

        assert_eq!(
            snapshot.counts(),
            SnapshotCounts {
                client_type: 0,
                trade: 1,
                limits: 0,
            }
        );
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn metadata_merge_combines_sources() {
        let listing = record(json!({
            "name": "FOLD",
            "Full_name": "Foolad Mobarakeh",
            "industry_num": 27,
            "Exchange": "TSE",
            "valid": "1",
        }));
        let daily = record(json!({"pe": "6.2", "tmax": 5300, "tmin": 4700}));
        let static_detail = record(json!({"name": "ignored", "is_fund": false}));

        let meta = InstrumentMetadata::merge(&listing, Some(&daily), Some(&static_detail));

        assert_eq!(meta.name.as_deref(), Some("FOLD"));
        assert_eq!(meta.industry_num.as_deref(), Some("27"));
        assert!(meta.valid);
        assert_eq!(meta.pe, Some(6.2));
        assert_eq!(meta.tmax, Some(5300.0));
        assert_eq!(meta.nav, None);
        assert_eq!(meta.flags.get("is_fund"), Some(&json!(false)));
        assert!(!meta.flags.contains_key("name"));
    }

    #[test]
    fn metadata_merge_degrades_missing_sources_to_none() {
        let listing = record(json!({"name": "KHODRO", "valid": "0"}));

        let meta = InstrumentMetadata::merge(&listing, None, None);

        assert_eq!(meta.name.as_deref(), Some("KHODRO"));
        assert_eq!(meta.full_name, None);
        assert!(!meta.valid);
        assert_eq!(meta.pe, None);
        assert!(meta.flags.is_empty());
    }

    #[test]
    fn metadata_serializes_with_wire_names() {
        let meta = InstrumentMetadata {
            full_name: Some("Iran Khodro".into()),
            valid: true,
            ..Default::default()
        };

        let json = serde_json::to_value(&meta).unwrap();

        assert_eq!(json["Full_name"], "Iran Khodro");
        assert_eq!(json["valid"], true);
        assert!(json["pe"].is_null());
        assert!(json.get("flags").is_none());
    }
}
