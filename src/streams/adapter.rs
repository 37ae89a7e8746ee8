//! Venue-facing side of the tick feed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::debug;

use super::consumer::{same_consumer, ConsumerRef};
use crate::broker::BrokerError;
use crate::types::Tick;

/// One streaming connection to a venue, shared by every handler in the
/// process. Constructed once at startup and passed to whoever needs it.
pub trait MarketDataAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Route ticks for `instrument` to `sink`
    fn subscribe(&self, instrument: &str, sink: ConsumerRef) -> Result<(), BrokerError>;

    fn unsubscribe(&self, instrument: &str, sink: &ConsumerRef);

    /// Whether the underlying connection is currently up
    fn is_ready(&self) -> bool;
}

/// Instrument to sinks routing shared by adapter implementations
#[derive(Default)]
pub struct SubscriptionTable {
    routes: RwLock<HashMap<String, Vec<ConsumerRef>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `sink` is the first one for `instrument`
    pub fn add(&self, instrument: &str, sink: ConsumerRef) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let sinks = routes.entry(instrument.to_string()).or_default();
        if sinks.iter().any(|s| same_consumer(s, &sink)) {
            return false;
        }
        sinks.push(sink);
        sinks.len() == 1
    }

    /// Returns true when the last sink for `instrument` was removed
    pub fn remove(&self, instrument: &str, sink: &ConsumerRef) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let Some(sinks) = routes.get_mut(instrument) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|s| !same_consumer(s, sink));
        if sinks.is_empty() {
            routes.remove(instrument);
            return before > 0;
        }
        false
    }

    fn sinks(&self, instrument: &str) -> Vec<ConsumerRef> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver a tick to every sink of its instrument; returns how many
    pub fn dispatch(&self, tick: &Tick) -> usize {
        // Sinks run without the lock held so they may (un)subscribe
        let sinks = self.sinks(&tick.instrument);
        for sink in &sinks {
            sink.on_tick(tick);
        }
        if sinks.is_empty() {
            debug!(instrument = %tick.instrument, "Tick for unsubscribed instrument");
        }
        sinks.len()
    }

    pub fn notify_success(&self, instrument: &str) {
        for sink in self.sinks(instrument) {
            sink.on_subscription_success(instrument);
        }
    }

    pub fn notify_failure(&self, instrument: &str, reason: &str) {
        for sink in self.sinks(instrument) {
            sink.on_subscription_failure(instrument, reason);
        }
    }

    pub fn instruments(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(instrument)
    }
}

/// In-process adapter: ticks are injected with `publish`. Used for replay
/// and tests.
pub struct LoopbackAdapter {
    table: SubscriptionTable,
    ready: AtomicBool,
}

impl Default for LoopbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self {
            table: SubscriptionTable::new(),
            ready: AtomicBool::new(true),
        }
    }

    pub fn publish(&self, tick: &Tick) -> usize {
        self.table.dispatch(tick)
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.table.is_subscribed(instrument)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl MarketDataAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "loopback"
    }

    fn subscribe(&self, instrument: &str, sink: ConsumerRef) -> Result<(), BrokerError> {
        if self.table.add(instrument, sink) {
            debug!(instrument, "Loopback subscription opened");
        }
        self.table.notify_success(instrument);
        Ok(())
    }

    fn unsubscribe(&self, instrument: &str, sink: &ConsumerRef) {
        if self.table.remove(instrument, sink) {
            debug!(instrument, "Loopback subscription closed");
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
