//! Upstream WebSocket Message Types
//!
//! Wire format types for the provider's streaming feed. Outbound requests
//! are JSON objects with an `action` and optional `params`; inbound frames
//! are JSON arrays whose elements are discriminated by the `ev` field.
//!
//! # Outbound
//! - `{"action":"auth","params":"<api key>"}`
//! - `{"action":"subscribe","params":"T.AAPL,Q.AAPL"}`
//! - `{"action":"unsubscribe","params":"AM.MSFT"}`
//! - `{"action":"ping"}`
//!
//! # Inbound
//! - `status`: connection and authentication acknowledgments
//! - `T`: trade
//! - `Q`: quote
//! - `AM`: minute aggregate

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{AggregateMessage, QuoteMessage, SubscriptionKey, TradeMessage};

// =============================================================================
// Outbound Requests
// =============================================================================

/// Action verb of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Authenticate the session.
    Auth,
    /// Add channels.
    Subscribe,
    /// Remove channels.
    Unsubscribe,
    /// Keep-alive.
    Ping,
}

/// Request written to the upstream socket.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ClientRequest {
    /// Action verb.
    pub action: Action,
    /// Action parameters (token or comma-joined channel list).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

impl ClientRequest {
    /// Authentication request.
    #[must_use]
    pub fn auth(token: &str) -> Self {
        Self {
            action: Action::Auth,
            params: Some(token.to_string()),
        }
    }

    /// Subscribe request for a set of keys, in iteration order.
    #[must_use]
    pub fn subscribe<'a>(keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> Self {
        Self {
            action: Action::Subscribe,
            params: Some(join_params(keys)),
        }
    }

    /// Unsubscribe request for a set of keys, in iteration order.
    #[must_use]
    pub fn unsubscribe<'a>(keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> Self {
        Self {
            action: Action::Unsubscribe,
            params: Some(join_params(keys)),
        }
    }

    /// Keep-alive ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            action: Action::Ping,
            params: None,
        }
    }

    /// Number of channel entries carried by a subscribe/unsubscribe request.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        match (self.action, &self.params) {
            (Action::Subscribe | Action::Unsubscribe, Some(p)) if !p.is_empty() => {
                p.split(',').count()
            }
            _ => 0,
        }
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = match (self.action, &self.params) {
            (Action::Auth, Some(_)) => Some("[REDACTED]"),
            (_, p) => p.as_deref(),
        };
        f.debug_struct("ClientRequest")
            .field("action", &self.action)
            .field("params", &params)
            .finish()
    }
}

fn join_params<'a>(keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> String {
    keys.into_iter()
        .map(SubscriptionKey::wire_param)
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Inbound: Status
// =============================================================================

/// Kind of status frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Socket accepted, awaiting authentication.
    Connected,
    /// Credentials accepted.
    AuthSuccess,
    /// Credentials rejected.
    AuthFailed,
    /// Generic acknowledgment (subscribe/unsubscribe confirmations).
    Success,
    /// Anything else the provider sends.
    #[serde(other)]
    Other,
}

/// Status frame.
///
/// # Wire Format (JSON)
/// ```json
/// {"ev": "status", "status": "auth_success", "message": "authenticated"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Status kind.
    pub status: StatusKind,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Inbound: Market Data
// =============================================================================

/// Trade event.
///
/// # Wire Format (JSON)
/// ```json
/// {"ev": "T", "sym": "AAPL", "p": 189.5, "s": 100, "t": 1700000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireTrade {
    /// Ticker symbol.
    pub sym: String,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Size.
    #[serde(rename = "s")]
    pub size: u64,
    /// Unix milliseconds.
    #[serde(rename = "t", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Quote event.
///
/// # Wire Format (JSON)
/// ```json
/// {"ev": "Q", "sym": "AAPL", "bp": 189.4, "bs": 2, "ap": 189.6, "as": 3, "t": 1700000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireQuote {
    /// Ticker symbol.
    pub sym: String,
    /// Bid price.
    #[serde(rename = "bp")]
    pub bid_price: Decimal,
    /// Bid size.
    #[serde(rename = "bs")]
    pub bid_size: u64,
    /// Ask price.
    #[serde(rename = "ap")]
    pub ask_price: Decimal,
    /// Ask size.
    #[serde(rename = "as")]
    pub ask_size: u64,
    /// Unix milliseconds.
    #[serde(rename = "t", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Minute aggregate event.
///
/// # Wire Format (JSON)
/// ```json
/// {"ev": "AM", "sym": "AAPL", "o": 189.1, "c": 189.5, "h": 189.9, "l": 189.0,
///  "v": 48213, "n": 512, "s": 1700000000000, "e": 1700000060000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireAggregate {
    /// Ticker symbol.
    pub sym: String,
    /// Open.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Volume.
    #[serde(rename = "v")]
    pub volume: u64,
    /// Trades in window.
    #[serde(rename = "n", default)]
    pub num_trades: u64,
    /// Window start, unix milliseconds.
    #[serde(rename = "s", with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,
}

impl From<WireTrade> for TradeMessage {
    fn from(w: WireTrade) -> Self {
        Self {
            symbol: w.sym,
            price: w.price,
            size: w.size,
            timestamp: w.timestamp,
        }
    }
}

impl From<WireQuote> for QuoteMessage {
    fn from(w: WireQuote) -> Self {
        Self {
            symbol: w.sym,
            bid_price: w.bid_price,
            bid_size: w.bid_size,
            ask_price: w.ask_price,
            ask_size: w.ask_size,
            timestamp: w.timestamp,
        }
    }
}

impl From<WireAggregate> for AggregateMessage {
    fn from(w: WireAggregate) -> Self {
        Self {
            symbol: w.sym,
            open: w.open,
            close: w.close,
            high: w.high,
            low: w.low,
            volume: w.volume,
            num_trades: w.num_trades,
            window_start: w.window_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::Channel;

    #[test]
    fn serialize_auth_request() {
        let json = serde_json::to_string(&ClientRequest::auth("secret")).unwrap();
        assert_eq!(json, r#"{"action":"auth","params":"secret"}"#);
    }

    #[test]
    fn serialize_ping_omits_params() {
        let json = serde_json::to_string(&ClientRequest::ping()).unwrap();
        assert_eq!(json, r#"{"action":"ping"}"#);
    }

    #[test]
    fn serialize_subscribe_joins_keys() {
        let keys = [
            SubscriptionKey::new("AAPL", Channel::Trade),
            SubscriptionKey::new("AAPL", Channel::Quote),
            SubscriptionKey::new("MSFT", Channel::MinuteAggregate),
        ];
        let request = ClientRequest::subscribe(&keys);

        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"action":"subscribe","params":"T.AAPL,Q.AAPL,AM.MSFT"}"#
        );
        assert_eq!(request.entry_count(), 3);
    }

    #[test]
    fn debug_redacts_auth_token() {
        let debug = format!("{:?}", ClientRequest::auth("super-secret"));
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn deserialize_status_unknown_kind() {
        let msg: StatusMessage =
            serde_json::from_str(r#"{"ev":"status","status":"max_connections"}"#).unwrap();
        assert_eq!(msg.status, StatusKind::Other);
        assert!(msg.message.is_empty());
    }

    #[test]
    fn deserialize_trade() {
        let wire: WireTrade = serde_json::from_str(
            r#"{"ev":"T","sym":"AAPL","p":189.5,"s":100,"t":1700000000000,"x":4}"#,
        )
        .unwrap();
        let trade = TradeMessage::from(wire);

        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.price, Decimal::new(1895, 1));
        assert_eq!(trade.size, 100);
        assert_eq!(trade.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn deserialize_aggregate_defaults_trade_count() {
        let wire: WireAggregate = serde_json::from_str(
            r#"{"ev":"AM","sym":"MSFT","o":1,"c":2,"h":3,"l":0.5,"v":10,"s":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(wire.num_trades, 0);
        assert_eq!(wire.low, Decimal::new(5, 1));
    }
}
