//! Stream Messages
//!
//! JSON schema of the messages exchanged with WebSocket clients.
//!
//! Outbound: `{type, status?, message?, subscribed_stocks?, timestamp, data}`
//! where `timestamp` is Unix seconds and `data` is null for control messages.
//!
//! Inbound: `{"type": "subscribe" | "unsubscribe", "stocks": [ids] | id | "all"}`;
//! any other message is echoed back.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::domain::instrument::InstrumentId;
use crate::domain::series::{InstrumentSummary, StockUpdate, unix_seconds};
use crate::domain::subscription::{ALL_INSTRUMENTS, SubscriptionTarget};

// =============================================================================
// Outbound
// =============================================================================

/// Outbound message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Sent once on connect.
    ConnectionStatus,
    /// Reply to subscribe/unsubscribe.
    SubscriptionUpdate,
    /// Latest values of subscribed instruments.
    StockUpdate,
    /// Summary of every instrument.
    AllStocksUpdate,
    /// Unrecognised client message, sent back.
    Echo,
    /// Rejected client message.
    Error,
}

impl MessageKind {
    /// Wire name, also used as a metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionStatus => "connection_status",
            Self::SubscriptionUpdate => "subscription_update",
            Self::StockUpdate => "stock_update",
            Self::AllStocksUpdate => "all_stocks_update",
            Self::Echo => "echo",
            Self::Error => "error",
        }
    }
}

/// A message sent to a WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Outcome of a control request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    /// Human-readable text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Current subscription of the connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribed_stocks: Option<Vec<String>>,
    /// Send time, Unix seconds.
    pub timestamp: f64,
    /// Payload; null for control messages.
    pub data: Value,
}

impl OutboundMessage {
    fn control(kind: MessageKind) -> Self {
        Self {
            kind,
            status: None,
            message: None,
            subscribed_stocks: None,
            timestamp: unix_seconds(Utc::now()),
            data: Value::Null,
        }
    }

    /// Greeting sent when a connection opens.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            status: Some("connected"),
            message: Some("Connected to exchange data service".to_string()),
            ..Self::control(MessageKind::ConnectionStatus)
        }
    }

    /// Reply to a successful subscribe/unsubscribe.
    #[must_use]
    pub fn subscription_update(subscribed: Vec<String>) -> Self {
        Self {
            status: Some("success"),
            subscribed_stocks: Some(subscribed),
            ..Self::control(MessageKind::SubscriptionUpdate)
        }
    }

    /// Echo of an unrecognised message.
    #[must_use]
    pub fn echo(original: Value) -> Self {
        Self {
            data: original,
            ..Self::control(MessageKind::Echo)
        }
    }

    /// In-band error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::control(MessageKind::Error)
        }
    }

    /// Latest values of the given instruments.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be converted to JSON.
    pub fn stock_update(
        data: &BTreeMap<InstrumentId, StockUpdate>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_value(data)?,
            ..Self::control(MessageKind::StockUpdate)
        })
    }

    /// Summary of every instrument.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be converted to JSON.
    pub fn all_stocks_update(
        data: &BTreeMap<InstrumentId, InstrumentSummary>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_value(data)?,
            ..Self::control(MessageKind::AllStocksUpdate)
        })
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// A rejected client message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientMessageError {
    /// Not valid JSON.
    #[error("Invalid JSON format")]
    InvalidJson,

    /// Valid JSON but a malformed subscribe/unsubscribe request.
    #[error("Error processing request: {0}")]
    InvalidRequest(String),
}

impl ClientMessageError {
    /// Metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// A parsed client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Add to the subscription.
    Subscribe(SubscriptionTarget),
    /// Remove from the subscription.
    Unsubscribe(SubscriptionTarget),
    /// Anything else; echoed back.
    Other(Value),
}

impl ClientRequest {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientMessageError::InvalidJson`] for non-JSON input and
    /// [`ClientMessageError::InvalidRequest`] for a subscribe/unsubscribe
    /// whose `stocks` field is missing or has the wrong shape.
    pub fn parse(raw: &str) -> Result<Self, ClientMessageError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|_| ClientMessageError::InvalidJson)?;

        match value.get("type").and_then(Value::as_str) {
            Some("subscribe") => Ok(Self::Subscribe(parse_target(&value)?)),
            Some("unsubscribe") => Ok(Self::Unsubscribe(parse_target(&value)?)),
            _ => Ok(Self::Other(value)),
        }
    }
}

fn parse_target(value: &Value) -> Result<SubscriptionTarget, ClientMessageError> {
    let Some(stocks) = value.get("stocks") else {
        return Ok(SubscriptionTarget::Instruments(Vec::new()));
    };

    match stocks {
        Value::Array(items) => {
            let ids = items
                .iter()
                .map(instrument_id)
                .collect::<Result<Vec<_>, _>>()?;
            if ids.iter().any(|id| id == ALL_INSTRUMENTS) {
                Ok(SubscriptionTarget::All)
            } else {
                Ok(SubscriptionTarget::Instruments(ids))
            }
        }
        single => {
            let id = instrument_id(single)?;
            if id == ALL_INSTRUMENTS {
                Ok(SubscriptionTarget::All)
            } else {
                Ok(SubscriptionTarget::Instruments(vec![id]))
            }
        }
    }
}

fn instrument_id(value: &Value) -> Result<InstrumentId, ClientMessageError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ClientMessageError::InvalidRequest(format!(
            "invalid instrument id: {other}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn ids(list: &[&str]) -> SubscriptionTarget {
        SubscriptionTarget::Instruments(list.iter().map(ToString::to_string).collect())
    }

    #[test_case(r#"{"type":"subscribe","stocks":["A","B"]}"#, ClientRequest::Subscribe(ids(&["A", "B"])) ; "list")]
    #[test_case(r#"{"type":"subscribe","stocks":"A"}"#, ClientRequest::Subscribe(ids(&["A"])) ; "single id")]
    #[test_case(r#"{"type":"subscribe","stocks":12345}"#, ClientRequest::Subscribe(ids(&["12345"])) ; "numeric id")]
    #[test_case(r#"{"type":"subscribe","stocks":"all"}"#, ClientRequest::Subscribe(SubscriptionTarget::All) ; "all token")]
    #[test_case(r#"{"type":"unsubscribe","stocks":["all"]}"#, ClientRequest::Unsubscribe(SubscriptionTarget::All) ; "all in list")]
    #[test_case(r#"{"type":"unsubscribe","stocks":[]}"#, ClientRequest::Unsubscribe(ids(&[])) ; "empty list")]
    #[test_case(r#"{"type":"subscribe"}"#, ClientRequest::Subscribe(ids(&[])) ; "missing stocks")]
    fn parse_subscription_requests(raw: &str, expected: ClientRequest) {
        assert_eq!(ClientRequest::parse(raw).unwrap(), expected);
    }

    #[test]
    fn unknown_type_is_echoed() {
        let request = ClientRequest::parse(r#"{"type":"ping","n":1}"#).unwrap();

        assert_eq!(request, ClientRequest::Other(json!({"type": "ping", "n": 1})));
    }

    #[test]
    fn missing_type_is_echoed() {
        let request = ClientRequest::parse("[1,2]").unwrap();

        assert_eq!(request, ClientRequest::Other(json!([1, 2])));
    }

    #[test_case("not json", ClientMessageError::InvalidJson ; "garbage")]
    #[test_case(r#"{"type":"subscribe","stocks":true}"#, ClientMessageError::InvalidRequest("invalid instrument id: true".into()) ; "boolean")]
    #[test_case(r#"{"type":"subscribe","stocks":[null]}"#, ClientMessageError::InvalidRequest("invalid instrument id: null".into()) ; "null id")]
    #[test_case(r#"{"type":"unsubscribe","stocks":{"a":1}}"#, ClientMessageError::InvalidRequest(r#"invalid instrument id: {"a":1}"#.into()) ; "object")]
    fn parse_errors(raw: &str, expected: ClientMessageError) {
        assert_eq!(ClientRequest::parse(raw).unwrap_err(), expected);
    }

    #[test]
    fn error_replies_use_fixed_text() {
        assert_eq!(ClientMessageError::InvalidJson.to_string(), "Invalid JSON format");
        assert_eq!(
            ClientMessageError::InvalidRequest("bad".into()).to_string(),
            "Error processing request: bad"
        );
    }

    #[test]
    fn connected_message_schema() {
        let json: Value = serde_json::from_str(&OutboundMessage::connected().to_text().unwrap())
            .unwrap();

        assert_eq!(json["type"], "connection_status");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["message"], "Connected to exchange data service");
        assert!(json["data"].is_null());
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
        assert!(json.get("subscribed_stocks").is_none());
    }

    #[test]
    fn subscription_update_schema() {
        let message = OutboundMessage::subscription_update(vec!["B".into()]);
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "subscription_update");
        assert_eq!(json["status"], "success");
        assert_eq!(json["subscribed_stocks"], json!(["B"]));
    }

    #[test]
    fn echo_carries_original_message() {
        let json = serde_json::to_value(OutboundMessage::echo(json!({"hello": "world"}))).unwrap();

        assert_eq!(json["type"], "echo");
        assert_eq!(json["data"]["hello"], "world");
    }
}
