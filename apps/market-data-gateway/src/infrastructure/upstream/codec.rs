//! Stream Codec
//!
//! JSON encoding and decoding for the upstream feed. Frames are split
//! into their elements first so one malformed element only loses itself;
//! each element is then decoded by its `ev` discriminator.

use serde_json::Value;

use super::messages::{ClientRequest, StatusMessage, WireAggregate, WireQuote, WireTrade};
use crate::domain::streaming::{AggregateMessage, MarketMessage, QuoteMessage, TradeMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Element had no `ev` discriminator.
    #[error("missing event discriminator")]
    MissingDiscriminator,

    /// Unknown event type.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Frame was neither an array nor an object.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

impl CodecError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::MissingDiscriminator => "missing_discriminator",
            Self::UnknownEventType(_) => "unknown_event",
            Self::InvalidFormat(_) => "invalid_format",
        }
    }
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Connection/authentication status.
    Status(StatusMessage),
    /// Market data record.
    Market(MarketMessage),
}

/// JSON codec for the upstream stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Split a text frame into its raw elements.
    ///
    /// A single object is treated as a one-element array.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON, or is JSON but
    /// neither an array nor an object.
    pub fn split(&self, text: &str) -> Result<Vec<Value>, CodecError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => Ok(items),
            obj @ Value::Object(_) => Ok(vec![obj]),
            other => {
                let rendered = other.to_string();
                Err(CodecError::InvalidFormat(
                    rendered.chars().take(50).collect(),
                ))
            }
        }
    }

    /// Decode one element by its `ev` discriminator.
    ///
    /// # Errors
    ///
    /// Returns an error for missing or unknown discriminators and for
    /// elements whose fields do not match the discriminated shape.
    pub fn decode_event(&self, value: Value) -> Result<UpstreamEvent, CodecError> {
        let ev = value
            .get("ev")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingDiscriminator)?
            .to_string();

        let event = match ev.as_str() {
            "status" => UpstreamEvent::Status(serde_json::from_value(value)?),
            "T" => {
                let wire: WireTrade = serde_json::from_value(value)?;
                UpstreamEvent::Market(TradeMessage::from(wire).into())
            }
            "Q" => {
                let wire: WireQuote = serde_json::from_value(value)?;
                UpstreamEvent::Market(QuoteMessage::from(wire).into())
            }
            "AM" => {
                let wire: WireAggregate = serde_json::from_value(value)?;
                UpstreamEvent::Market(AggregateMessage::from(wire).into())
            }
            _ => return Err(CodecError::UnknownEventType(ev)),
        };

        Ok(event)
    }

    /// Decode a whole frame, keeping per-element results.
    ///
    /// # Errors
    ///
    /// Returns an error only if the frame itself cannot be split.
    pub fn decode(&self, text: &str) -> Result<Vec<Result<UpstreamEvent, CodecError>>, CodecError> {
        Ok(self
            .split(text)?
            .into_iter()
            .map(|v| self.decode_event(v))
            .collect())
    }

    /// Encode an outbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, request: &ClientRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::upstream::messages::StatusKind;
    use rust_decimal::Decimal;

    #[test]
    fn decode_status_array() {
        let events = JsonCodec::new()
            .decode(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#)
            .unwrap();

        assert_eq!(events.len(), 1);
        let Ok(UpstreamEvent::Status(status)) = &events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.status, StatusKind::AuthSuccess);
        assert_eq!(status.message, "authenticated");
    }

    #[test]
    fn decode_single_object() {
        let events = JsonCodec::new()
            .decode(r#"{"ev":"status","status":"connected"}"#)
            .unwrap();
        assert!(matches!(events[0], Ok(UpstreamEvent::Status(_))));
    }

    #[test]
    fn decode_mixed_data_frame() {
        let text = r#"[
            {"ev":"T","sym":"AAPL","p":189.5,"s":100,"t":1700000000000},
            {"ev":"Q","sym":"AAPL","bp":189.4,"bs":2,"ap":189.6,"as":3,"t":1700000000001},
            {"ev":"AM","sym":"MSFT","o":1,"c":2,"h":3,"l":0.5,"v":10,"n":4,"s":1700000000000}
        ]"#;
        let events = JsonCodec::new().decode(text).unwrap();

        assert_eq!(events.len(), 3);
        let Ok(UpstreamEvent::Market(MarketMessage::Quote(quote))) = &events[1] else {
            panic!("expected quote");
        };
        assert_eq!(quote.ask_price, Decimal::new(1896, 1));
        assert!(matches!(
            events[2],
            Ok(UpstreamEvent::Market(MarketMessage::Aggregate(_)))
        ));
    }

    #[test]
    fn malformed_element_only_fails_itself() {
        let text = r#"[
            {"ev":"T","sym":"AAPL","p":"not a price","s":100,"t":1},
            {"ev":"XQ","sym":"AAPL"},
            {"sym":"AAPL"},
            {"ev":"T","sym":"MSFT","p":410.1,"s":5,"t":1700000000000}
        ]"#;
        let events = JsonCodec::new().decode(text).unwrap();

        assert!(matches!(events[0], Err(CodecError::Json(_))));
        assert!(matches!(events[1], Err(CodecError::UnknownEventType(ref ev)) if ev == "XQ"));
        assert!(matches!(events[2], Err(CodecError::MissingDiscriminator)));
        assert!(events[3].is_ok());
    }

    #[test]
    fn non_json_frame_fails_whole() {
        assert!(matches!(
            JsonCodec::new().decode("not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            JsonCodec::new().decode("42"),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_array_yields_nothing() {
        assert!(JsonCodec::new().decode("[]").unwrap().is_empty());
    }

    #[test]
    fn encode_ping() {
        assert_eq!(
            JsonCodec::new().encode(&ClientRequest::ping()).unwrap(),
            r#"{"action":"ping"}"#
        );
    }
}
