//! Consumer-facing side of the tick feed

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, warn};

use super::adapter::MarketDataAdapter;
use super::consumer::{same_consumer, ConsumerRef, TickConsumer};
use crate::broker::BrokerError;
use crate::types::Tick;

/// Multiplexes one adapter subscription per instrument to any number of
/// consumers, and remembers the last tick seen for each instrument.
pub struct TickHandler {
    adapter: Arc<dyn MarketDataAdapter>,
    consumers: RwLock<HashMap<String, Vec<ConsumerRef>>>,
    last_ticks: RwLock<HashMap<String, Tick>>,
    /// Instruments the feed has acknowledged
    confirmed: RwLock<HashSet<String>>,
    me: Weak<TickHandler>,
}

impl TickHandler {
    pub fn new(adapter: Arc<dyn MarketDataAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            adapter,
            consumers: RwLock::new(HashMap::new()),
            last_ticks: RwLock::new(HashMap::new()),
            confirmed: RwLock::new(HashSet::new()),
            me: me.clone(),
        })
    }

    fn as_sink(&self) -> Option<ConsumerRef> {
        self.me.upgrade().map(|me| me as ConsumerRef)
    }

    /// Register `consumer` for `instrument`. The first consumer of an
    /// instrument opens the adapter subscription; later ones are told about
    /// it straight away if the feed already acknowledged it.
    pub fn subscribe(&self, instrument: &str, consumer: ConsumerRef) -> Result<(), BrokerError> {
        let first = {
            let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
            let list = consumers.entry(instrument.to_string()).or_default();
            if list.iter().any(|c| same_consumer(c, &consumer)) {
                return Ok(());
            }
            list.push(consumer.clone());
            list.len() == 1
        };

        if first {
            let Some(sink) = self.as_sink() else {
                return Ok(());
            };
            if let Err(e) = self.adapter.subscribe(instrument, sink) {
                warn!(instrument, "Feed subscription failed: {}", e);
                self.remove_consumer(instrument, &consumer);
                return Err(e);
            }
            info!(instrument, adapter = self.adapter.name(), "Subscribed to live ticks");
        } else if self.is_confirmed(instrument) {
            consumer.on_subscription_success(instrument);
        }
        Ok(())
    }

    /// Remove `consumer`; the last one leaving closes the adapter subscription
    pub fn unsubscribe(&self, instrument: &str, consumer: &ConsumerRef) {
        if self.remove_consumer(instrument, consumer) {
            self.set_confirmed(instrument, false);
            if let Some(sink) = self.as_sink() {
                self.adapter.unsubscribe(instrument, &sink);
            }
            info!(instrument, "Unsubscribed from live ticks");
        }
    }

    /// Returns true when no consumers remain for the instrument
    fn remove_consumer(&self, instrument: &str, consumer: &ConsumerRef) -> bool {
        let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = consumers.get_mut(instrument) else {
            return false;
        };
        list.retain(|c| !same_consumer(c, consumer));
        if list.is_empty() {
            consumers.remove(instrument);
            true
        } else {
            false
        }
    }

    pub fn last_tick(&self, instrument: &str) -> Option<Tick> {
        self.last_ticks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instrument)
            .cloned()
    }

    fn is_confirmed(&self, instrument: &str) -> bool {
        self.confirmed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(instrument)
    }

    fn set_confirmed(&self, instrument: &str, confirmed: bool) {
        let mut set = self.confirmed.write().unwrap_or_else(|e| e.into_inner());
        if confirmed {
            set.insert(instrument.to_string());
        } else {
            set.remove(instrument);
        }
    }

    pub fn is_feed_ready(&self) -> bool {
        self.adapter.is_ready()
    }

    fn consumers_of(&self, instrument: &str) -> Vec<ConsumerRef> {
        self.consumers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }
}

impl TickConsumer for TickHandler {
    fn on_tick(&self, tick: &Tick) {
        self.last_ticks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tick.instrument.clone(), tick.clone());

        for consumer in self.consumers_of(&tick.instrument) {
            consumer.on_tick(tick);
        }
    }

    fn on_subscription_success(&self, instrument: &str) {
        debug!(instrument, "Feed subscription confirmed");
        self.set_confirmed(instrument, true);
        for consumer in self.consumers_of(instrument) {
            consumer.on_subscription_success(instrument);
        }
    }

    fn on_subscription_failure(&self, instrument: &str, reason: &str) {
        warn!(instrument, reason, "Feed subscription rejected");
        self.set_confirmed(instrument, false);
        for consumer in self.consumers_of(instrument) {
            consumer.on_subscription_failure(instrument, reason);
        }
    }
}
