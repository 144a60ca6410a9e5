//! Snapshot relay adapter.
//!
//! Endpoints, relative to the base URL:
//! - `GET /client-type`
//! - `GET /trades?flow=N`
//! - `GET /best-limits?flow=N`
//!
//! Each answers a JSON array of rows carrying the exchange column names.
//! Rows are keyed by `InsCode`; best-limit rows additionally carry the
//! level in `number` (1 to 5).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{build_client, get_json};
use crate::application::ports::{FetchError, Flow, SnapshotSource};
use crate::domain::instrument::{
    BestLimitRecord, ClientTypeRecord, InstrumentId, ORDER_BOOK_DEPTH, OrderBookLevels,
    RawRecord, TradeRecord, value_as_string,
};

const ID_FIELD: &str = "InsCode";
const LEVEL_FIELD: &str = "number";

/// HTTP client for the snapshot relay.
#[derive(Debug, Clone)]
pub struct RelaySnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl RelaySnapshotSource {
    /// Create a source for the relay at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self::with_client(build_client(timeout)?, base_url))
    }

    /// Create a source sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn rows(&self, endpoint: &str, flow: Option<Flow>) -> Result<Vec<RawRecord>, FetchError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let query: Vec<(&str, String)> = flow
            .map(|flow| vec![("flow", flow.to_string())])
            .unwrap_or_default();

        match get_json(&self.client, &url, &query).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(FetchError::Malformed {
                message: format!("expected an array of rows from {endpoint}, got {}", kind(&other)),
            }),
        }
    }
}

#[async_trait]
impl SnapshotSource for RelaySnapshotSource {
    async fn fetch_client_type(&self) -> Result<HashMap<InstrumentId, ClientTypeRecord>, FetchError> {
        let rows = self.rows("client-type", None).await?;
        Ok(keyed_records(rows))
    }

    async fn fetch_trades(&self, flow: Flow) -> Result<HashMap<InstrumentId, TradeRecord>, FetchError> {
        let rows = self.rows("trades", Some(flow)).await?;
        Ok(keyed_records(rows))
    }

    async fn fetch_best_limits(
        &self,
        flow: Flow,
    ) -> Result<HashMap<InstrumentId, OrderBookLevels>, FetchError> {
        let rows = self.rows("best-limits", Some(flow)).await?;
        Ok(order_books(rows))
    }
}

/// Decode rows keyed by instrument ID. Later rows for the same ID win.
fn keyed_records<T: DeserializeOwned>(rows: Vec<RawRecord>) -> HashMap<InstrumentId, T> {
    let mut records = HashMap::with_capacity(rows.len());
    for row in rows {
        let Some(id) = row.get(ID_FIELD).and_then(value_as_string) else {
            continue;
        };
        match serde_json::from_value(Value::Object(row)) {
            Ok(record) => {
                records.insert(id, record);
            }
            Err(e) => tracing::debug!(instrument = %id, error = %e, "Skipping undecodable row"),
        }
    }
    records
}

/// Group best-limit rows into per-instrument levels, dropping out-of-range levels.
fn order_books(rows: Vec<RawRecord>) -> HashMap<InstrumentId, OrderBookLevels> {
    let mut books: HashMap<InstrumentId, OrderBookLevels> = HashMap::new();
    for row in rows {
        let Some(id) = row.get(ID_FIELD).and_then(value_as_string) else {
            continue;
        };
        let Some(level) = row
            .get(LEVEL_FIELD)
            .and_then(value_as_string)
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=ORDER_BOOK_DEPTH).contains(&usize::from(*n)))
        else {
            continue;
        };
        if let Ok(record) = serde_json::from_value::<BestLimitRecord>(Value::Object(row)) {
            books.entry(id).or_default().insert(level, record);
        }
    }
    books
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
