//! Instrument Time Series
//!
//! Append-only per-field history for one instrument, organised in three
//! field groups that each grow in lock-step:
//!
//! - trade-core (`time`, `pf`, `pl`, `pc`, `py`, `pmax`, `pmin`, `tno`, `tvol`, `tval`)
//! - client-type (eight raw columns plus four derived metrics)
//! - order-book (six columns for each of five levels)
//!
//! Groups may have different lengths: client-type data is only appended when
//! the cycle carried it, while the order-book group is zero-filled whenever a
//! trade sample is appended.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::instrument::{
    BestLimitRecord, ClientTypeRecord, InstrumentMetadata, ORDER_BOOK_DEPTH, OrderBookLevels,
    TradeRecord,
};

fn or_zero(value: Option<f64>) -> f64 {
    value.unwrap_or(0.0)
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

// =============================================================================
// Trade Series
// =============================================================================

/// Trade-core vectors with their sample timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeSeries {
    /// Sample timestamps.
    pub time: Vec<DateTime<Utc>>,
    /// Opening price.
    pub pf: Vec<f64>,
    /// Last traded price.
    pub pl: Vec<f64>,
    /// Closing price.
    pub pc: Vec<f64>,
    /// Previous session close.
    pub py: Vec<f64>,
    /// Session high.
    pub pmax: Vec<f64>,
    /// Session low.
    pub pmin: Vec<f64>,
    /// Transaction count.
    pub tno: Vec<f64>,
    /// Traded volume.
    pub tvol: Vec<f64>,
    /// Traded value.
    pub tval: Vec<f64>,
}

impl TradeSeries {
    fn push(&mut self, at: DateTime<Utc>, record: &TradeRecord) {
        self.time.push(at);
        self.pf.push(or_zero(record.first));
        self.pl.push(or_zero(record.last));
        self.pc.push(or_zero(record.closing));
        self.py.push(or_zero(record.yesterday));
        self.pmax.push(or_zero(record.max));
        self.pmin.push(or_zero(record.min));
        self.tno.push(or_zero(record.transactions));
        self.tvol.push(or_zero(record.volume));
        self.tval.push(or_zero(record.value));
    }

    /// Number of trade samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when no trade sample was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Drop the oldest samples so at most `keep` remain, across every vector.
    pub fn retain_last(&mut self, keep: usize) {
        let excess = self.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        self.time.drain(..excess);
        for column in [
            &mut self.pf,
            &mut self.pl,
            &mut self.pc,
            &mut self.py,
            &mut self.pmax,
            &mut self.pmin,
            &mut self.tno,
            &mut self.tvol,
            &mut self.tval,
        ] {
            column.drain(..excess);
        }
    }
}

// =============================================================================
// Client-Type Series
// =============================================================================

/// Metrics derived from one client-type record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedMetrics {
    /// Legal plus natural buy volume.
    pub aggregate_buy: f64,
    /// Legal plus natural sell volume.
    pub aggregate_sell: f64,
    /// Aggregate buy over aggregate sell, 0 when nothing was sold.
    pub power_ratio: f64,
    /// Natural share of the aggregate buy, 0 when nothing was bought.
    pub natural_buy_ratio: f64,
}

impl DerivedMetrics {
    /// Compute the derived metrics of a client-type record.
    #[must_use]
    pub fn from_record(record: &ClientTypeRecord) -> Self {
        let buy_natural = or_zero(record.buy_natural_volume);
        let aggregate_buy = or_zero(record.buy_legal_volume) + buy_natural;
        let aggregate_sell =
            or_zero(record.sell_legal_volume) + or_zero(record.sell_natural_volume);

        Self {
            aggregate_buy,
            aggregate_sell,
            power_ratio: ratio(aggregate_buy, aggregate_sell),
            natural_buy_ratio: ratio(buy_natural, aggregate_buy),
        }
    }
}

/// Client-type vectors plus the derived-metric vectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientTypeSeries {
    /// Buy volume, legal.
    #[serde(rename = "Buy_I_Volume")]
    pub buy_legal_volume: Vec<f64>,
    /// Buy volume, natural.
    #[serde(rename = "Buy_N_Volume")]
    pub buy_natural_volume: Vec<f64>,
    /// Sell volume, legal.
    #[serde(rename = "Sell_I_Volume")]
    pub sell_legal_volume: Vec<f64>,
    /// Sell volume, natural.
    #[serde(rename = "Sell_N_Volume")]
    pub sell_natural_volume: Vec<f64>,
    /// Buyer count, legal.
    #[serde(rename = "Buy_CountI")]
    pub buy_legal_count: Vec<f64>,
    /// Buyer count, natural.
    #[serde(rename = "Buy_CountN")]
    pub buy_natural_count: Vec<f64>,
    /// Seller count, legal.
    #[serde(rename = "Sell_CountI")]
    pub sell_legal_count: Vec<f64>,
    /// Seller count, natural.
    #[serde(rename = "Sell_CountN")]
    pub sell_natural_count: Vec<f64>,
    /// Aggregate buy volume.
    pub aggregate_buy: Vec<f64>,
    /// Aggregate sell volume.
    pub aggregate_sell: Vec<f64>,
    /// Buy/sell power ratio.
    pub power_ratio: Vec<f64>,
    /// Natural-investor buy ratio.
    pub natural_buy_ratio: Vec<f64>,
}

impl ClientTypeSeries {
    fn push(&mut self, record: &ClientTypeRecord) {
        let derived = DerivedMetrics::from_record(record);

        self.buy_legal_volume.push(or_zero(record.buy_legal_volume));
        self.buy_natural_volume
            .push(or_zero(record.buy_natural_volume));
        self.sell_legal_volume.push(or_zero(record.sell_legal_volume));
        self.sell_natural_volume
            .push(or_zero(record.sell_natural_volume));
        self.buy_legal_count.push(or_zero(record.buy_legal_count));
        self.buy_natural_count.push(or_zero(record.buy_natural_count));
        self.sell_legal_count.push(or_zero(record.sell_legal_count));
        self.sell_natural_count
            .push(or_zero(record.sell_natural_count));
        self.aggregate_buy.push(derived.aggregate_buy);
        self.aggregate_sell.push(derived.aggregate_sell);
        self.power_ratio.push(derived.power_ratio);
        self.natural_buy_ratio.push(derived.natural_buy_ratio);
    }

    /// Number of client-type samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buy_legal_volume.len()
    }

    /// True when no client-type sample was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buy_legal_volume.is_empty()
    }
}

// =============================================================================
// Order-Book Series
// =============================================================================

/// Vectors of one order-book level.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelSeries {
    /// Bid order count.
    pub zd: Vec<f64>,
    /// Bid quantity.
    pub qd: Vec<f64>,
    /// Bid price.
    pub pd: Vec<f64>,
    /// Ask price.
    pub po: Vec<f64>,
    /// Ask quantity.
    pub qo: Vec<f64>,
    /// Ask order count.
    pub zo: Vec<f64>,
}

impl LevelSeries {
    fn push(&mut self, record: Option<&BestLimitRecord>) {
        let field = |f: fn(&BestLimitRecord) -> Option<f64>| record.and_then(f).unwrap_or(0.0);

        self.zd.push(field(|r| r.bid_orders));
        self.qd.push(field(|r| r.bid_quantity));
        self.pd.push(field(|r| r.bid_price));
        self.po.push(field(|r| r.ask_price));
        self.qo.push(field(|r| r.ask_quantity));
        self.zo.push(field(|r| r.ask_orders));
    }
}

/// Five order-book levels, index 0 is level 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookSeries {
    /// Per-level vectors.
    pub levels: [LevelSeries; ORDER_BOOK_DEPTH],
}

impl OrderBookSeries {
    fn push(&mut self, levels: Option<&OrderBookLevels>) {
        for (index, level) in self.levels.iter_mut().enumerate() {
            let number = u8::try_from(index + 1).unwrap_or(u8::MAX);
            level.push(levels.and_then(|l| l.get(&number)));
        }
    }

    /// Number of order-book samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels[0].zd.len()
    }

    /// True when no order-book sample was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels[0].zd.is_empty()
    }

    fn last(&self, level: usize, pick: fn(&LevelSeries) -> &Vec<f64>) -> Option<f64> {
        self.levels.get(level).and_then(|l| pick(l).last().copied())
    }
}

// =============================================================================
// Instrument Series
// =============================================================================

/// Full history of one instrument plus its denormalized metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentSeries {
    /// Trade-core group.
    #[serde(flatten)]
    pub trade: TradeSeries,
    /// Client-type group.
    #[serde(flatten)]
    pub client_type: ClientTypeSeries,
    /// Order-book group.
    pub order_book: OrderBookSeries,
    /// Copy of the directory entry.
    pub metadata: InstrumentMetadata,
}

/// Sample counts of one series, per field group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleCounts {
    /// Trade-core samples.
    pub trade: usize,
    /// Client-type samples.
    pub client_type: usize,
    /// Order-book samples.
    pub order_book: usize,
}

impl InstrumentSeries {
    /// Create an empty series carrying the given metadata.
    #[must_use]
    pub fn with_metadata(metadata: InstrumentMetadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// Append one trade-core sample.
    pub fn append_trade(&mut self, at: DateTime<Utc>, record: &TradeRecord) {
        self.trade.push(at, record);
    }

    /// Append one client-type sample with its derived metrics.
    pub fn append_client_type(&mut self, record: &ClientTypeRecord) {
        self.client_type.push(record);
    }

    /// Append one order-book sample, zero-filling missing levels.
    pub fn append_order_book(&mut self, levels: Option<&OrderBookLevels>) {
        self.order_book.push(levels);
    }

    /// True when at least one trade sample exists.
    #[must_use]
    pub fn has_samples(&self) -> bool {
        !self.trade.is_empty()
    }

    /// Per-group sample counts.
    #[must_use]
    pub fn sample_counts(&self) -> SampleCounts {
        SampleCounts {
            trade: self.trade.len(),
            client_type: self.client_type.len(),
            order_book: self.order_book.len(),
        }
    }

    /// Latest-value projection pushed to per-instrument subscribers.
    #[must_use]
    pub fn stock_update(&self) -> Option<StockUpdate> {
        let at = *self.trade.time.last()?;
        let last = |v: &Vec<f64>| v.last().copied();
        let ct = &self.client_type;

        Some(StockUpdate {
            timestamp: at,
            price: PriceUpdate {
                last: last(&self.trade.pl),
                closing: last(&self.trade.pc),
                min: last(&self.trade.pmin),
                max: last(&self.trade.pmax),
            },
            volume: last(&self.trade.tvol),
            value: last(&self.trade.tval),
            transactions: last(&self.trade.tno),
            client_type: ClientTypeUpdate {
                buy_legal: last(&ct.buy_legal_volume),
                buy_natural: last(&ct.buy_natural_volume),
                sell_legal: last(&ct.sell_legal_volume),
                sell_natural: last(&ct.sell_natural_volume),
            },
            metadata: self.metadata.clone(),
        })
    }

    /// Summary projection used by the all-instruments view.
    #[must_use]
    pub fn summary(&self) -> Option<InstrumentSummary> {
        let t = &self.trade;
        let last = |v: &Vec<f64>| v.last().copied().unwrap_or(0.0);
        if t.is_empty() {
            return None;
        }

        let pl = last(&t.pl);
        let py = last(&t.py);
        let ob = &self.order_book;

        Some(InstrumentSummary {
            pf: last(&t.pf),
            pl,
            pc: last(&t.pc),
            tval: last(&t.tval),
            py,
            pchange: if py > 0.0 { pl - py } else { 0.0 },
            pmin: last(&t.pmin),
            pmax: last(&t.pmax),
            qd1: ob.last(0, |l| &l.qd),
            pd1: ob.last(0, |l| &l.pd),
            qo1: ob.last(0, |l| &l.qo),
            po1: ob.last(0, |l| &l.po),
            metadata: self.metadata.clone(),
        })
    }
}

/// Seconds since the Unix epoch with sub-second precision.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

// =============================================================================
// Projections
// =============================================================================

/// Latest prices of one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// Last traded price.
    pub last: Option<f64>,
    /// Closing price.
    pub closing: Option<f64>,
    /// Session low.
    pub min: Option<f64>,
    /// Session high.
    pub max: Option<f64>,
}

/// Latest client-type volumes of one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClientTypeUpdate {
    /// Buy volume, legal.
    pub buy_legal: Option<f64>,
    /// Buy volume, natural.
    pub buy_natural: Option<f64>,
    /// Sell volume, legal.
    pub sell_legal: Option<f64>,
    /// Sell volume, natural.
    pub sell_natural: Option<f64>,
}

/// Per-instrument payload of a `stock_update` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockUpdate {
    /// Time of the latest trade sample, serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// Latest prices.
    pub price: PriceUpdate,
    /// Traded volume.
    pub volume: Option<f64>,
    /// Traded value.
    pub value: Option<f64>,
    /// Transaction count.
    pub transactions: Option<f64>,
    /// Client-type volumes, `None` fields until client-type data arrives.
    pub client_type: ClientTypeUpdate,
    /// Instrument metadata.
    pub metadata: InstrumentMetadata,
}

/// Per-instrument entry of the summary view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentSummary {
    /// Opening price.
    pub pf: f64,
    /// Last traded price.
    pub pl: f64,
    /// Closing price.
    pub pc: f64,
    /// Traded value.
    pub tval: f64,
    /// Previous close.
    pub py: f64,
    /// Last minus previous close, 0 without a previous close.
    pub pchange: f64,
    /// Session low.
    pub pmin: f64,
    /// Session high.
    pub pmax: f64,
    /// Level-1 bid quantity.
    pub qd1: Option<f64>,
    /// Level-1 bid price.
    pub pd1: Option<f64>,
    /// Level-1 ask quantity.
    pub qo1: Option<f64>,
    /// Level-1 ask price.
    pub po1: Option<f64>,
    /// Instrument metadata.
    pub metadata: InstrumentMetadata,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn trade(last: f64, yesterday: f64) -> TradeRecord {
        TradeRecord {
            last: Some(last),
            yesterday: Some(yesterday),
            ..Default::default()
        }
    }

    fn client_type(bi: f64, bn: f64, si: f64, sn: f64) -> ClientTypeRecord {
        ClientTypeRecord {
            buy_legal_volume: Some(bi),
            buy_natural_volume: Some(bn),
            sell_legal_volume: Some(si),
            sell_natural_volume: Some(sn),
            ..Default::default()
        }
    }

    #[test_case(200.0, 300.0, 100.0, 400.0, 1.0, 0.6 ; "balanced")]
    #[test_case(0.0, 0.0, 100.0, 100.0, 0.0, 0.0 ; "nothing bought")]
    #[test_case(50.0, 50.0, 0.0, 0.0, 0.0, 0.5 ; "nothing sold")]
    #[test_case(300.0, 0.0, 50.0, 50.0, 3.0, 0.0 ; "legal only")]
    fn derived_metrics(bi: f64, bn: f64, si: f64, sn: f64, power: f64, natural: f64) {
        let derived = DerivedMetrics::from_record(&client_type(bi, bn, si, sn));

        assert!((derived.power_ratio - power).abs() < 1e-9);
        assert!((derived.natural_buy_ratio - natural).abs() < 1e-9);
    }

    #[test]
    fn missing_client_type_fields_count_as_zero() {
        let derived = DerivedMetrics::from_record(&ClientTypeRecord {
            buy_natural_volume: Some(10.0),
            ..Default::default()
        });

        assert!((derived.aggregate_buy - 10.0).abs() < f64::EPSILON);
        assert!(derived.aggregate_sell.abs() < f64::EPSILON);
        assert!((derived.natural_buy_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_append_zero_fills_absent_fields() {
        let mut series = InstrumentSeries::default();

        series.append_trade(Utc::now(), &TradeRecord {
            last: Some(100.0),
            ..Default::default()
        });

        assert_eq!(series.trade.pl, vec![100.0]);
        assert_eq!(series.trade.pc, vec![0.0]);
        assert_eq!(series.trade.tval, vec![0.0]);
        assert_eq!(series.sample_counts().trade, 1);
    }

    #[test]
    fn order_book_append_zero_fills_missing_levels() {
        let mut series = InstrumentSeries::default();
        let mut levels = OrderBookLevels::new();
        levels.insert(2, BestLimitRecord {
            bid_price: Some(1500.0),
            ask_price: Some(1510.0),
            ..Default::default()
        });

        series.append_order_book(Some(&levels));
        series.append_order_book(None);

        assert_eq!(series.order_book.len(), 2);
        assert_eq!(series.order_book.levels[0].pd, vec![0.0, 0.0]);
        assert_eq!(series.order_book.levels[1].pd, vec![1500.0, 0.0]);
        assert_eq!(series.order_book.levels[1].po, vec![1510.0, 0.0]);
        assert_eq!(series.order_book.levels[4].zo, vec![0.0, 0.0]);
    }

    #[test]
    fn groups_grow_independently() {
        let mut series = InstrumentSeries::default();

        series.append_trade(Utc::now(), &trade(100.0, 95.0));
        series.append_order_book(None);
        series.append_trade(Utc::now(), &trade(101.0, 95.0));
        series.append_client_type(&client_type(1.0, 1.0, 1.0, 1.0));
        series.append_order_book(None);

        assert_eq!(series.sample_counts(), SampleCounts {
            trade: 2,
            client_type: 1,
            order_book: 2,
        });
        assert_eq!(series.client_type.aggregate_buy.len(), 1);
    }

    #[test]
    fn summary_requires_a_trade_sample() {
        let series = InstrumentSeries::default();

        assert!(series.summary().is_none());
        assert!(series.stock_update().is_none());
    }

    #[test_case(100.0, 95.0, 5.0 ; "positive previous close")]
    #[test_case(100.0, 0.0, 0.0 ; "no previous close")]
    fn summary_pchange(last: f64, yesterday: f64, expected: f64) {
        let mut series = InstrumentSeries::default();
        series.append_trade(Utc::now(), &trade(last, yesterday));
        series.append_order_book(None);

        let summary = series.summary().unwrap();

        assert!((summary.pchange - expected).abs() < f64::EPSILON);
        assert_eq!(summary.qd1, Some(0.0));
    }

    #[test]
    fn stock_update_uses_latest_values() {
        let mut series = InstrumentSeries::with_metadata(InstrumentMetadata {
            name: Some("FOLD".into()),
            ..Default::default()
        });
        let at = Utc::now();
        series.append_trade(at, &trade(100.0, 95.0));
        series.append_trade(at, &trade(102.0, 95.0));

        let update = series.stock_update().unwrap();

        assert_eq!(update.price.last, Some(102.0));
        assert_eq!(update.client_type.buy_legal, None);
        assert_eq!(update.metadata.name.as_deref(), Some("FOLD"));

        let json = serde_json::to_value(&update).unwrap();
        let sent = json["timestamp"].as_str().unwrap();
        assert_eq!(DateTime::parse_from_rfc3339(sent).unwrap(), at);
    }

    #[test]
    fn retain_last_trims_every_trade_column() {
        let mut series = InstrumentSeries::default();
        for last in [1.0, 2.0, 3.0, 4.0] {
            series.append_trade(Utc::now(), &trade(last, 0.5));
        }

        series.trade.retain_last(2);

        let t = &series.trade;
        assert_eq!(t.pl, vec![3.0, 4.0]);
        for column in [&t.pf, &t.pc, &t.py, &t.pmax, &t.pmin, &t.tno, &t.tvol, &t.tval] {
            assert_eq!(column.len(), 2);
        }
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn series_serializes_flat_trade_and_client_fields() {
        let mut series = InstrumentSeries::default();
        series.append_trade(Utc::now(), &trade(100.0, 95.0));
        series.append_client_type(&client_type(1.0, 2.0, 3.0, 4.0));

        let json = serde_json::to_value(&series).unwrap();

        assert_eq!(json["pl"][0], 100.0);
        assert_eq!(json["Buy_N_Volume"][0], 2.0);
        assert_eq!(json["order_book"]["levels"].as_array().unwrap().len(), 5);
    }

    proptest! {
        #[test]
        fn natural_buy_ratio_is_a_fraction(
            bi in 0.0f64..1e12,
            bn in 0.0f64..1e12,
            si in 0.0f64..1e12,
            sn in 0.0f64..1e12,
        ) {
            let derived = DerivedMetrics::from_record(&client_type(bi, bn, si, sn));

            prop_assert!((0.0..=1.0).contains(&derived.natural_buy_ratio));
            prop_assert!(derived.power_ratio >= 0.0);
            prop_assert!(derived.power_ratio.is_finite());
        }
    }
}
