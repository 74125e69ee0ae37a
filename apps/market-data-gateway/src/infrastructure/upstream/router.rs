//! Message Router
//!
//! Parses inbound frames and fans each market data record out to every
//! observer registered for its (symbol, channel) key.
//!
//! Parse failures are logged and dropped. Observer failures, whether a
//! returned error or a panic, are logged and isolated: the remaining
//! observers for the same message still receive it, and the connection
//! is never affected.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::codec::{CodecError, JsonCodec, UpstreamEvent};
use super::messages::StatusMessage;
use crate::domain::streaming::{self, MarketMessage};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics;

/// Outcome of routing a single frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Status frames, handed back to the connection state machine.
    pub statuses: Vec<StatusMessage>,
    /// Market data records parsed from the frame.
    pub messages: usize,
    /// Elements dropped as unparseable or unrecognized.
    pub dropped: usize,
    /// Observer callbacks that failed.
    pub observer_failures: usize,
}

/// Routes parsed frames to registered observers.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SubscriptionRegistry>,
    codec: JsonCodec,
}

impl MessageRouter {
    /// Create a router over a registry.
    #[must_use]
    pub const fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            codec: JsonCodec::new(),
        }
    }

    /// Parse a text frame and deliver its contents.
    pub fn route(&self, text: &str) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        let events = match self.codec.decode(text) {
            Ok(events) => events,
            Err(e) => {
                log_drop(&e, text);
                outcome.dropped += 1;
                return outcome;
            }
        };

        for event in events {
            match event {
                Ok(UpstreamEvent::Status(status)) => outcome.statuses.push(status),
                Ok(UpstreamEvent::Market(message)) => {
                    outcome.messages += 1;
                    outcome.observer_failures += self.dispatch(&message);
                }
                Err(e) => {
                    log_drop(&e, text);
                    outcome.dropped += 1;
                }
            }
        }

        outcome
    }

    /// Deliver one message to every observer for its key.
    ///
    /// Returns the number of observers that failed.
    pub fn dispatch(&self, message: &MarketMessage) -> usize {
        let channel = message.channel();
        metrics::record_message_received(channel);

        // Cloned out of the registry so observers may re-enter it.
        let handlers = self.registry.handlers_for(&message.key());
        let mut failures = 0;

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                streaming::deliver(handler.as_ref(), message)
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    metrics::record_observer_failure(channel, "error");
                    tracing::warn!(
                        symbol = message.symbol(),
                        channel = %channel,
                        error = %e,
                        "Observer failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    metrics::record_observer_failure(channel, "panic");
                    tracing::error!(
                        symbol = message.symbol(),
                        channel = %channel,
                        "Observer panicked"
                    );
                }
            }
        }

        failures
    }
}

fn log_drop(error: &CodecError, frame: &str) {
    metrics::record_parse_error(error.kind());
    let preview: String = frame.chars().take(120).collect();
    tracing::warn!(error = %error, frame = %preview, "Dropping unparseable upstream frame");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::{
        Channel, MarketDataObserver, ObserverError, QuoteMessage, TradeMessage,
    };
    use crate::infrastructure::upstream::messages::StatusKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        trades: Mutex<Vec<TradeMessage>>,
        quotes: Mutex<Vec<QuoteMessage>>,
    }

    impl MarketDataObserver for Recorder {
        fn on_trade(&self, trade: &TradeMessage) -> Result<(), ObserverError> {
            self.trades.lock().push(trade.clone());
            Ok(())
        }

        fn on_quote(&self, quote: &QuoteMessage) -> Result<(), ObserverError> {
            self.quotes.lock().push(quote.clone());
            Ok(())
        }
    }

    struct Failing;
    impl MarketDataObserver for Failing {
        fn on_trade(&self, _trade: &TradeMessage) -> Result<(), ObserverError> {
            Err(ObserverError::Failed("boom".to_string()))
        }
    }

    struct Panicking;
    impl MarketDataObserver for Panicking {
        fn on_trade(&self, _trade: &TradeMessage) -> Result<(), ObserverError> {
            panic!("observer bug");
        }
    }

    const TRADE: &str = r#"[{"ev":"T","sym":"AAPL","p":189.5,"s":100,"t":1700000000000}]"#;

    fn setup() -> (Arc<SubscriptionRegistry>, MessageRouter) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let router = MessageRouter::new(Arc::clone(&registry));
        (registry, router)
    }

    #[test]
    fn delivers_to_matching_observers_only() {
        let (registry, router) = setup();
        let aapl = Arc::new(Recorder::default());
        let msft = Arc::new(Recorder::default());
        registry.subscribe(1, &["AAPL".to_string()], &[Channel::Trade], aapl.clone()).unwrap();
        registry.subscribe(2, &["MSFT".to_string()], &[Channel::Trade], msft.clone()).unwrap();

        let outcome = router.route(TRADE);

        assert_eq!(outcome.messages, 1);
        assert_eq!(aapl.trades.lock().len(), 1);
        assert!(msft.trades.lock().is_empty());
    }

    #[test]
    fn channel_must_match() {
        let (registry, router) = setup();
        let quotes_only = Arc::new(Recorder::default());
        registry.subscribe(1, &["AAPL".to_string()], &[Channel::Quote], quotes_only.clone()).unwrap();

        router.route(TRADE);

        assert!(quotes_only.trades.lock().is_empty());
    }

    #[test]
    fn failing_observers_are_isolated() {
        let (registry, router) = setup();
        let healthy = Arc::new(Recorder::default());
        registry.subscribe(1, &["AAPL".to_string()], &[Channel::Trade], Arc::new(Failing)).unwrap();
        registry.subscribe(2, &["AAPL".to_string()], &[Channel::Trade], Arc::new(Panicking)).unwrap();
        registry.subscribe(3, &["AAPL".to_string()], &[Channel::Trade], healthy.clone()).unwrap();

        let outcome = router.route(TRADE);

        assert_eq!(outcome.observer_failures, 2);
        assert_eq!(healthy.trades.lock().len(), 1);
    }

    #[test]
    fn preserves_order_within_frame() {
        let (registry, router) = setup();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(1, &["AAPL".to_string()], &[Channel::Trade], recorder.clone()).unwrap();

        router.route(
            r#"[{"ev":"T","sym":"AAPL","p":1,"s":1,"t":1},
                {"ev":"T","sym":"AAPL","p":2,"s":1,"t":2},
                {"ev":"T","sym":"AAPL","p":3,"s":1,"t":3}]"#,
        );

        let sizes: Vec<String> = recorder
            .trades
            .lock()
            .iter()
            .map(|t| t.price.to_string())
            .collect();
        assert_eq!(sizes, vec!["1", "2", "3"]);
    }

    #[test]
    fn returns_status_frames() {
        let (_, router) = setup();

        let outcome =
            router.route(r#"[{"ev":"status","status":"auth_failed","message":"bad key"}]"#);

        assert_eq!(outcome.statuses.len(), 1);
        assert_eq!(outcome.statuses[0].status, StatusKind::AuthFailed);
    }

    #[test]
    fn drops_garbage_and_unknown_events() {
        let (registry, router) = setup();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(1, &["AAPL".to_string()], &[Channel::Trade], recorder.clone()).unwrap();

        assert_eq!(router.route("{{{").dropped, 1);

        let outcome = router.route(
            r#"[{"ev":"LULD","sym":"AAPL"},{"ev":"T","sym":"AAPL","p":1,"s":1,"t":1}]"#,
        );
        assert_eq!(outcome.dropped, 1);
        assert_eq!(recorder.trades.lock().len(), 1);
    }

    #[test]
    fn observer_may_reenter_registry() {
        struct Unsubscriber(Arc<SubscriptionRegistry>);
        impl MarketDataObserver for Unsubscriber {
            fn on_trade(&self, _trade: &TradeMessage) -> Result<(), ObserverError> {
                self.0.unsubscribe(7, &["AAPL".to_string()], &[Channel::Trade]).unwrap();
                Ok(())
            }
        }

        let (registry, router) = setup();
        registry
            .subscribe(
                7,
                &["AAPL".to_string()],
                &[Channel::Trade],
                Arc::new(Unsubscriber(Arc::clone(&registry))),
            )
            .unwrap();

        router.route(TRADE);

        assert!(registry.active_keys().is_empty());
    }
}
