//! Market Data Streaming Types
//!
//! Core domain types for the shared market data stream: channel kinds,
//! subscription keys, symbol validation, the immutable message records,
//! and the typed observer interface consumers implement to receive them.
//!
//! These types are wire-agnostic. The upstream codec converts provider
//! frames into [`MarketMessage`] values and never hands raw JSON past
//! the infrastructure layer.

mod message;
mod observer;

pub use message::{AggregateMessage, MarketMessage, QuoteMessage, TradeMessage};
pub use observer::{MarketDataObserver, ObserverError};
pub(crate) use observer::deliver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Symbols
// =============================================================================

/// A normalized ticker symbol (upper-case, validated).
pub type Symbol = String;

/// Longest ticker accepted from callers.
pub const MAX_SYMBOL_LEN: usize = 12;

/// Errors raised while validating caller-supplied symbols and channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// The symbol list contained no symbols.
    #[error("symbol list is empty")]
    Empty,

    /// A symbol had invalid length or characters.
    #[error("invalid symbol: {0:?}")]
    Invalid(String),

    /// More symbols than the configured batch maximum.
    #[error("too many symbols: {count} (max {max})")]
    TooMany {
        /// Number of symbols supplied.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A channel name did not match any known channel.
    #[error("unknown channel: {0:?}")]
    UnknownChannel(String),
}

/// Normalize a single caller-supplied symbol.
///
/// Trims whitespace and upper-cases. Accepts 1 to [`MAX_SYMBOL_LEN`]
/// characters from `A-Z`, `0-9`, `.` and `-`, starting with a letter or
/// digit. Symbols end up in upstream URL paths, so `.` and `..` must never
/// pass.
///
/// # Errors
///
/// Returns [`SymbolError::Invalid`] if the symbol is empty, too long,
/// or contains other characters.
pub fn normalize_symbol(raw: &str) -> Result<Symbol, SymbolError> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid = symbol
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');

    if valid {
        Ok(symbol)
    } else {
        Err(SymbolError::Invalid(raw.to_string()))
    }
}

/// Parse a comma-separated symbol list, deduplicating while keeping order.
///
/// # Errors
///
/// Returns an error if the list is empty, any symbol is invalid, or the
/// number of distinct symbols exceeds `max`.
pub fn parse_symbol_list(raw: &str, max: usize) -> Result<Vec<Symbol>, SymbolError> {
    let mut symbols: Vec<Symbol> = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let symbol = normalize_symbol(part)?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }

    if symbols.is_empty() {
        return Err(SymbolError::Empty);
    }
    if symbols.len() > max {
        return Err(SymbolError::TooMany {
            count: symbols.len(),
            max,
        });
    }
    Ok(symbols)
}

// =============================================================================
// Channels
// =============================================================================

/// Category of streaming message for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Individual trade prints.
    Trade,
    /// Top-of-book quotes.
    Quote,
    /// Per-minute OHLCV aggregates.
    MinuteAggregate,
}

impl Channel {
    /// Every channel kind.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Trade, Self::Quote, Self::MinuteAggregate]
    }

    /// Upstream subscription prefix (`T`, `Q`, `AM`).
    #[must_use]
    pub const fn wire_prefix(self) -> &'static str {
        match self {
            Self::Trade => "T",
            Self::Quote => "Q",
            Self::MinuteAggregate => "AM",
        }
    }

    /// Stable lowercase name, used in metrics labels and the HTTP API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Quote => "quote",
            Self::MinuteAggregate => "minute_aggregate",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trade" | "trades" | "t" => Ok(Self::Trade),
            "quote" | "quotes" | "q" => Ok(Self::Quote),
            "minute_aggregate" | "aggregate" | "aggregates" | "am" => Ok(Self::MinuteAggregate),
            _ => Err(SymbolError::UnknownChannel(s.to_string())),
        }
    }
}

/// Parse a comma-separated channel list. An empty list yields every channel.
///
/// # Errors
///
/// Returns [`SymbolError::UnknownChannel`] for an unrecognized name.
pub fn parse_channel_list(raw: &str) -> Result<Vec<Channel>, SymbolError> {
    let mut channels = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let channel: Channel = part.parse()?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        channels.extend_from_slice(Channel::all());
    }
    Ok(channels)
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Composite key identifying one upstream subscription: (symbol, channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    /// Normalized ticker symbol.
    pub symbol: Symbol,
    /// Channel kind.
    pub channel: Channel,
}

impl SubscriptionKey {
    /// Create a key.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, channel: Channel) -> Self {
        Self {
            symbol: symbol.into(),
            channel,
        }
    }

    /// Upstream parameter form, e.g. `T.AAPL`.
    #[must_use]
    pub fn wire_param(&self) -> String {
        format!("{}.{}", self.channel.wire_prefix(), self.symbol)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
