//! Subscription Registry
//!
//! Reference-counts interest in (symbol, channel) pairs contributed by
//! many independent consumers and computes the minimal upstream delta.
//!
//! # Design
//!
//! The registry tracks:
//! - The handler each consumer registered for each key
//! - Which keys each consumer holds (for bulk removal)
//!
//! A key's refcount is the number of consumers holding it. The only
//! mutators are [`SubscriptionRegistry::subscribe`],
//! [`SubscriptionRegistry::unsubscribe`] and
//! [`SubscriptionRegistry::unsubscribe_all`], and each returns the
//! [`SubscriptionDelta`] its change produced, so refcounts can never move
//! without the matching upstream instruction being computed.
//!
//! Symbols are normalized on the way in, so `aapl` and `AAPL` share one
//! key. A call with any invalid symbol fails before the table is touched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::streaming::{
    Channel, MarketDataObserver, SubscriptionKey, Symbol, SymbolError, normalize_symbol,
};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer (UI widget, SSE client, ...).
pub type ConsumerId = u64;

/// Shared handle to a consumer's observer.
pub type ObserverHandle = Arc<dyn MarketDataObserver>;

// =============================================================================
// Subscription Delta
// =============================================================================

/// Upstream instructions needed to reconcile the feed with the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    /// Keys whose refcount went from 0 to 1.
    pub subscribe: BTreeSet<SubscriptionKey>,
    /// Keys whose refcount returned to 0.
    pub unsubscribe: BTreeSet<SubscriptionKey>,
}

impl SubscriptionDelta {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create a delta that subscribes the given keys.
    #[must_use]
    pub fn subscribe_only(keys: impl IntoIterator<Item = SubscriptionKey>) -> Self {
        Self {
            subscribe: keys.into_iter().collect(),
            unsubscribe: BTreeSet::new(),
        }
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Default)]
struct RegistryState {
    /// Handlers per key; the map's length is the key's refcount.
    entries: HashMap<SubscriptionKey, HashMap<ConsumerId, ObserverHandle>>,
    /// Keys held by each consumer.
    consumers: HashMap<ConsumerId, HashSet<SubscriptionKey>>,
}

impl RegistryState {
    /// Returns true if the key went 0 -> 1.
    fn add(&mut self, consumer: ConsumerId, key: SubscriptionKey, handler: ObserverHandle) -> bool {
        let handlers = self.entries.entry(key.clone()).or_default();
        let first = handlers.is_empty();
        // Same consumer again: replace the handler, refcount unchanged.
        handlers.insert(consumer, handler);
        self.consumers.entry(consumer).or_default().insert(key);
        first
    }

    /// Returns true if the key went 1 -> 0.
    fn remove(&mut self, consumer: ConsumerId, key: &SubscriptionKey) -> bool {
        let Some(handlers) = self.entries.get_mut(key) else {
            return false;
        };
        if handlers.remove(&consumer).is_none() {
            return false;
        }

        if let Some(held) = self.consumers.get_mut(&consumer) {
            held.remove(key);
            if held.is_empty() {
                self.consumers.remove(&consumer);
            }
        }

        if handlers.is_empty() {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe reference-counted subscription table.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_data_gateway::domain::streaming::{Channel, MarketDataObserver};
/// use market_data_gateway::domain::subscription::SubscriptionRegistry;
///
/// struct Widget;
/// impl MarketDataObserver for Widget {}
///
/// let registry = SubscriptionRegistry::new();
/// let aapl = ["AAPL".to_string()];
///
/// // Consumer 1 subscribes to AAPL trades
/// let delta = registry.subscribe(1, &aapl, &[Channel::Trade], Arc::new(Widget)).unwrap();
/// assert_eq!(delta.subscribe.len(), 1);
///
/// // Consumer 2 also subscribes - no upstream change needed
/// let delta = registry.subscribe(2, &aapl, &[Channel::Trade], Arc::new(Widget)).unwrap();
/// assert!(delta.is_empty());
///
/// // Consumer 1 unsubscribes - still held by consumer 2
/// assert!(registry.unsubscribe(1, &aapl, &[Channel::Trade]).unwrap().is_empty());
///
/// // Consumer 2 unsubscribes - now unsubscribe upstream
/// let delta = registry.unsubscribe(2, &aapl, &[Channel::Trade]).unwrap();
/// assert_eq!(delta.unsubscribe.len(), 1);
/// ```
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every (symbol, channel) pair.
    ///
    /// Returns the keys that need an upstream subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Invalid`] if any symbol fails validation;
    /// nothing is registered in that case.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        symbols: &[Symbol],
        channels: &[Channel],
        handler: ObserverHandle,
    ) -> Result<SubscriptionDelta, SymbolError> {
        let keys = keys_for(symbols, channels)?;
        let mut delta = SubscriptionDelta::default();
        let mut state = self.state.write();

        for key in keys {
            if state.add(consumer, key.clone(), Arc::clone(&handler)) {
                delta.subscribe.insert(key);
            }
        }

        Ok(delta)
    }

    /// Drop the consumer's interest in every (symbol, channel) pair.
    ///
    /// Pairs the consumer does not hold are ignored. Returns the keys
    /// that need an upstream unsubscribe.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Invalid`] if any symbol fails validation.
    pub fn unsubscribe(
        &self,
        consumer: ConsumerId,
        symbols: &[Symbol],
        channels: &[Channel],
    ) -> Result<SubscriptionDelta, SymbolError> {
        let keys = keys_for(symbols, channels)?;
        let mut delta = SubscriptionDelta::default();
        let mut state = self.state.write();

        for key in keys {
            if state.remove(consumer, &key) {
                delta.unsubscribe.insert(key);
            }
        }

        Ok(delta)
    }

    /// Remove every key held by a consumer.
    pub fn unsubscribe_all(&self, consumer: ConsumerId) -> SubscriptionDelta {
        let mut delta = SubscriptionDelta::default();
        let mut state = self.state.write();

        let held: Vec<SubscriptionKey> = state
            .consumers
            .get(&consumer)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        for key in held {
            if state.remove(consumer, &key) {
                delta.unsubscribe.insert(key);
            }
        }

        delta
    }

    /// Every key with refcount > 0, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.state.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of consumers holding a key.
    #[must_use]
    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.state.read().entries.get(key).map_or(0, HashMap::len)
    }

    /// Keys held by a consumer, sorted.
    #[must_use]
    pub fn consumer_keys(&self, consumer: ConsumerId) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self
            .state
            .read()
            .consumers
            .get(&consumer)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Snapshot of the handlers registered for a key.
    ///
    /// Handlers are cloned out so callers can invoke them without holding
    /// the registry lock.
    #[must_use]
    pub fn handlers_for(&self, key: &SubscriptionKey) -> Vec<ObserverHandle> {
        self.state
            .read()
            .entries
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        let symbols: HashSet<&str> = state.entries.keys().map(|k| k.symbol.as_str()).collect();
        SubscriptionStats {
            key_count: state.entries.len(),
            symbol_count: symbols.len(),
            consumer_count: state.consumers.len(),
        }
    }
}

/// Normalize every symbol, then pair it with every channel.
fn keys_for(
    symbols: &[Symbol],
    channels: &[Channel],
) -> Result<Vec<SubscriptionKey>, SymbolError> {
    let normalized = symbols
        .iter()
        .map(|raw| normalize_symbol(raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(normalized
        .iter()
        .flat_map(|symbol| {
            channels
                .iter()
                .map(move |channel| SubscriptionKey::new(symbol.clone(), *channel))
        })
        .collect())
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of (symbol, channel) keys live upstream.
    pub key_count: usize,
    /// Number of distinct symbols across those keys.
    pub symbol_count: usize,
    /// Number of consumers holding at least one key.
    pub consumer_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Noop;
    impl MarketDataObserver for Noop {}

    fn noop() -> ObserverHandle {
        Arc::new(Noop)
    }

    fn syms(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn key(symbol: &str, channel: Channel) -> SubscriptionKey {
        SubscriptionKey::new(symbol, channel)
    }

    #[test]
    fn subscribe_new_key() {
        let registry = SubscriptionRegistry::new();

        let delta = registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        assert!(delta.subscribe.contains(&key("AAPL", Channel::Trade)));
        assert!(delta.unsubscribe.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 1);
    }

    #[test]
    fn subscribe_existing_key_from_other_consumer() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        let delta = registry.subscribe(2, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        assert!(delta.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 2);
        assert_eq!(registry.handlers_for(&key("AAPL", Channel::Trade)).len(), 2);
    }

    #[test]
    fn resubscribe_same_consumer_replaces_handler() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        let delta = registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        assert!(delta.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 1);
        assert_eq!(registry.handlers_for(&key("AAPL", Channel::Trade)).len(), 1);
    }

    #[test]
    fn unsubscribe_with_remaining_consumers() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();
        registry.subscribe(2, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        let delta = registry.unsubscribe(1, &syms(&["AAPL"]), &[Channel::Trade]).unwrap();

        assert!(delta.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 1);
    }

    #[test]
    fn unsubscribe_last_consumer_removes_key() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        let delta = registry.unsubscribe(1, &syms(&["AAPL"]), &[Channel::Trade]).unwrap();

        assert!(delta.unsubscribe.contains(&key("AAPL", Channel::Trade)));
        assert!(registry.active_keys().is_empty());
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[test]
    fn unsubscribe_key_not_held_is_noop() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();

        let delta = registry.unsubscribe(2, &syms(&["AAPL"]), &[Channel::Trade]).unwrap();

        assert!(delta.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 1);
    }

    #[test]
    fn two_consumer_overlap_scenario() {
        let registry = SubscriptionRegistry::new();

        let a = registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Trade], noop()).unwrap();
        let b = registry
            .subscribe(2, &syms(&["AAPL"]), &[Channel::Trade, Channel::Quote], noop())
            .unwrap();
        assert_eq!(a.subscribe.len() + b.subscribe.len(), 2);
        assert_eq!(
            b.subscribe.iter().collect::<Vec<_>>(),
            vec![&key("AAPL", Channel::Quote)]
        );

        let a_leaves = registry.unsubscribe(1, &syms(&["AAPL"]), &[Channel::Trade]).unwrap();
        assert!(a_leaves.is_empty());

        let delta = registry
            .unsubscribe(2, &syms(&["AAPL"]), &[Channel::Trade, Channel::Quote])
            .unwrap();
        assert_eq!(delta.unsubscribe.len(), 2);
    }

    #[test]
    fn unsubscribe_all_preserves_other_consumers() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL", "MSFT"]), &[Channel::Quote], noop()).unwrap();
        registry.subscribe(2, &syms(&["AAPL"]), &[Channel::Quote], noop()).unwrap();

        let delta = registry.unsubscribe_all(1);

        assert_eq!(
            delta.unsubscribe.into_iter().collect::<Vec<_>>(),
            vec![key("MSFT", Channel::Quote)]
        );
        assert!(registry.consumer_keys(1).is_empty());
        assert_eq!(registry.active_keys(), vec![key("AAPL", Channel::Quote)]);
    }

    #[test]
    fn unsubscribe_all_unknown_consumer() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL"]), &[Channel::Quote], noop()).unwrap();

        assert!(registry.unsubscribe_all(99).is_empty());
        assert_eq!(registry.active_keys().len(), 1);
    }

    #[test]
    fn active_keys_are_sorted() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(1, &syms(&["MSFT", "AAPL"]), &[Channel::Quote, Channel::Trade], noop())
            .unwrap();

        assert_eq!(
            registry.active_keys(),
            vec![
                key("AAPL", Channel::Trade),
                key("AAPL", Channel::Quote),
                key("MSFT", Channel::Trade),
                key("MSFT", Channel::Quote),
            ]
        );
    }

    #[test]
    fn stats_are_accurate() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(1, &syms(&["AAPL", "MSFT"]), &[Channel::Trade], noop()).unwrap();
        registry.subscribe(2, &syms(&["AAPL"]), &[Channel::Quote], noop()).unwrap();

        let stats = registry.stats();

        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.symbol_count, 2);
        assert_eq!(stats.consumer_count, 2);
    }

    #[test]
    fn symbols_normalize_to_one_key() {
        let registry = SubscriptionRegistry::new();

        let first = registry.subscribe(1, &syms(&["aapl"]), &[Channel::Trade], noop()).unwrap();
        let second = registry.subscribe(2, &syms(&[" AAPL "]), &[Channel::Trade], noop()).unwrap();

        assert_eq!(
            first.subscribe.into_iter().collect::<Vec<_>>(),
            vec![key("AAPL", Channel::Trade)]
        );
        assert!(second.is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 2);

        assert!(registry.unsubscribe(1, &syms(&["Aapl"]), &[Channel::Trade]).unwrap().is_empty());
        assert_eq!(registry.refcount(&key("AAPL", Channel::Trade)), 1);
    }

    #[test]
    fn invalid_symbol_rejects_whole_call() {
        let registry = SubscriptionRegistry::new();

        let result = registry.subscribe(1, &syms(&["AAPL", "BAD SYM"]), &[Channel::Trade], noop());

        assert!(matches!(result, Err(SymbolError::Invalid(_))));
        assert!(registry.active_keys().is_empty());
        assert!(registry.consumer_keys(1).is_empty());
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::sync::Mutex;
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::new());
        let upstream = Arc::new(Mutex::new(Vec::new()));
        let mut handles = vec![];

        for i in 0..10u64 {
            let r = Arc::clone(&registry);
            let u = Arc::clone(&upstream);
            handles.push(thread::spawn(move || {
                let delta = r
                    .subscribe(
                        i,
                        &[format!("SYM{i}"), "SHARED".to_string()],
                        &[Channel::Trade],
                        noop(),
                    )
                    .unwrap();
                u.lock().unwrap().extend(delta.subscribe);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let sent = upstream.lock().unwrap();
        let shared = sent.iter().filter(|k| k.symbol == "SHARED").count();
        assert_eq!(shared, 1);
        assert_eq!(sent.len(), 11);
        assert_eq!(registry.refcount(&key("SHARED", Channel::Trade)), 10);
    }

    #[test]
    fn thread_safety_concurrent_unsubscribe_all() {
        use std::sync::Mutex;
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::new());
        for i in 0..10u64 {
            registry.subscribe(i, &syms(&["SHARED"]), &[Channel::Quote], noop()).unwrap();
        }

        let removed = Arc::new(Mutex::new(0usize));
        let mut handles = vec![];
        for i in 0..10u64 {
            let r = Arc::clone(&registry);
            let n = Arc::clone(&removed);
            handles.push(thread::spawn(move || {
                *n.lock().unwrap() += r.unsubscribe_all(i).unsubscribe.len();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*removed.lock().unwrap(), 1);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(ConsumerId, Vec<usize>, Vec<usize>),
        Unsubscribe(ConsumerId, Vec<usize>, Vec<usize>),
        UnsubscribeAll(ConsumerId),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let consumer = 0u64..4;
        let symbols = prop::collection::vec(0usize..4, 1..3);
        let channels = prop::collection::vec(0usize..3, 1..3);
        prop_oneof![
            (consumer.clone(), symbols.clone(), channels.clone())
                .prop_map(|(c, s, ch)| Op::Subscribe(c, s, ch)),
            (consumer.clone(), symbols, channels).prop_map(|(c, s, ch)| Op::Unsubscribe(c, s, ch)),
            consumer.prop_map(Op::UnsubscribeAll),
        ]
    }

    proptest! {
        #[test]
        fn upstream_view_matches_registry(ops in prop::collection::vec(op_strategy(), 1..60)) {
            const SYMBOLS: [&str; 4] = ["AAPL", "MSFT", "GOOG", "TSLA"];
            let to_symbols = |idx: &[usize]| -> Vec<Symbol> {
                idx.iter().map(|i| SYMBOLS[*i].to_string()).collect()
            };
            let to_channels = |idx: &[usize]| -> Vec<Channel> {
                idx.iter().map(|i| Channel::all()[*i]).collect()
            };

            let registry = SubscriptionRegistry::new();
            let mut upstream: BTreeSet<SubscriptionKey> = BTreeSet::new();

            for op in ops {
                let delta = match op {
                    Op::Subscribe(c, s, ch) => {
                        registry.subscribe(c, &to_symbols(&s), &to_channels(&ch), noop()).unwrap()
                    }
                    Op::Unsubscribe(c, s, ch) => {
                        registry.unsubscribe(c, &to_symbols(&s), &to_channels(&ch)).unwrap()
                    }
                    Op::UnsubscribeAll(c) => registry.unsubscribe_all(c),
                };

                for k in delta.subscribe {
                    // Never subscribe a key that is already live upstream.
                    prop_assert!(upstream.insert(k));
                }
                for k in delta.unsubscribe {
                    prop_assert!(upstream.remove(&k));
                    prop_assert_eq!(registry.refcount(&k), 0);
                }

                let active: BTreeSet<_> = registry.active_keys().into_iter().collect();
                prop_assert_eq!(&active, &upstream);
            }
        }
    }
}
