//! Per-instrument position book and pending orders

use std::collections::BTreeMap;
use tracing::debug;

use crate::persistence::{InstanceState, PendingOrder};
use crate::types::Signal;

/// Signed positions and at most one pending order per instrument
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    positions: BTreeMap<String, i64>,
    pending: BTreeMap<String, PendingOrder>,
    /// Failed resubmissions of the current pending order
    pending_failures: BTreeMap<String, u32>,
}

impl PositionBook {
    /// Flat book for the configured instruments
    pub fn new<S: AsRef<str>>(instruments: &[S]) -> Self {
        Self {
            positions: instruments
                .iter()
                .map(|s| (s.as_ref().to_string(), 0))
                .collect(),
            pending: BTreeMap::new(),
            pending_failures: BTreeMap::new(),
        }
    }

    /// Overlay saved state; instruments no longer configured are kept
    pub fn restore(&mut self, saved: &InstanceState) {
        for (instrument, quantity) in &saved.current_position {
            self.positions.insert(instrument.clone(), *quantity);
        }
        for order in &saved.pending_order_action {
            self.pending.insert(order.instrument.clone(), order.clone());
        }
    }

    pub fn position(&self, instrument: &str) -> i64 {
        self.positions.get(instrument).copied().unwrap_or(0)
    }

    pub fn positions(&self) -> &BTreeMap<String, i64> {
        &self.positions
    }

    /// Signed quantity that flips any opposite exposure and adds one lot
    pub fn order_quantity(&self, instrument: &str, signal: Signal, lot_size: i64) -> i64 {
        let position = self.position(instrument);
        match signal {
            Signal::Buy => lot_size + (-position).max(0),
            Signal::Sell => -(lot_size + position.max(0)),
            Signal::None => 0,
        }
    }

    /// Apply an acknowledged order and return the new position
    pub fn apply_fill(&mut self, instrument: &str, quantity: i64) -> i64 {
        let position = self.positions.entry(instrument.to_string()).or_insert(0);
        *position += quantity;
        debug!(instrument, quantity, position = *position, "Position updated");
        *position
    }

    /// Store a pending order, returning the one it replaced
    pub fn set_pending(&mut self, order: PendingOrder) -> Option<PendingOrder> {
        self.pending_failures.remove(&order.instrument);
        self.pending.insert(order.instrument.clone(), order)
    }

    /// Count a failed resubmission and return the total so far
    pub fn record_pending_failure(&mut self, instrument: &str) -> u32 {
        let failures = self.pending_failures.entry(instrument.to_string()).or_insert(0);
        *failures += 1;
        *failures
    }

    pub fn pending(&self, instrument: &str) -> Option<&PendingOrder> {
        self.pending.get(instrument)
    }

    pub fn clear_pending(&mut self, instrument: &str) -> Option<PendingOrder> {
        self.pending_failures.remove(instrument);
        self.pending.remove(instrument)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending.values().cloned().collect()
    }
}
