//! Immutable market data records produced by the upstream parser.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{Channel, SubscriptionKey, Symbol};

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeMessage {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Execution price.
    pub price: Decimal,
    /// Shares traded.
    pub size: u64,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteMessage {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Best bid price.
    pub bid_price: Decimal,
    /// Size at the best bid.
    pub bid_size: u64,
    /// Best ask price.
    pub ask_price: Decimal,
    /// Size at the best ask.
    pub ask_size: u64,
    /// Quote timestamp.
    pub timestamp: DateTime<Utc>,
}

/// One-minute OHLCV aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateMessage {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Opening price for the window.
    pub open: Decimal,
    /// Closing price for the window.
    pub close: Decimal,
    /// Highest price in the window.
    pub high: Decimal,
    /// Lowest price in the window.
    pub low: Decimal,
    /// Shares traded in the window.
    pub volume: u64,
    /// Number of trades in the window.
    pub num_trades: u64,
    /// Start of the aggregation window.
    pub window_start: DateTime<Utc>,
}

/// Discriminated market data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketMessage {
    /// Trade print.
    Trade(TradeMessage),
    /// Quote update.
    Quote(QuoteMessage),
    /// Minute aggregate.
    Aggregate(AggregateMessage),
}

impl MarketMessage {
    /// Symbol the record belongs to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(m) => &m.symbol,
            Self::Quote(m) => &m.symbol,
            Self::Aggregate(m) => &m.symbol,
        }
    }

    /// Channel the record was delivered on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Trade(_) => Channel::Trade,
            Self::Quote(_) => Channel::Quote,
            Self::Aggregate(_) => Channel::MinuteAggregate,
        }
    }

    /// Subscription key used to look up handlers.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol(), self.channel())
    }
}

impl From<TradeMessage> for MarketMessage {
    fn from(m: TradeMessage) -> Self {
        Self::Trade(m)
    }
}

impl From<QuoteMessage> for MarketMessage {
    fn from(m: QuoteMessage) -> Self {
        Self::Quote(m)
    }
}

impl From<AggregateMessage> for MarketMessage {
    fn from(m: AggregateMessage) -> Self {
        Self::Aggregate(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> TradeMessage {
        TradeMessage {
            symbol: "AAPL".to_string(),
            price: Decimal::new(18950, 2),
            size: 100,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn key_reflects_variant() {
        let msg = MarketMessage::from(trade());
        assert_eq!(msg.key(), SubscriptionKey::new("AAPL", Channel::Trade));
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(MarketMessage::from(trade())).unwrap();
        assert_eq!(json["type"], "trade");
        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["price"], "189.50");
    }
}
