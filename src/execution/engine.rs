//! Execution engine: gating, sizing, submission and position bookkeeping
//!
//! Callers serialise work per instrument; the engine itself only guards its
//! book against concurrent access from different instruments.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::config::{local_to_utc, GateDecision, SessionWindow};
use super::journal::{FillJournal, FillRecord};
use super::order::{OrderAck, OrderRequest};
use super::position::PositionBook;
use crate::broker::{BrokerError, OrderGateway};
use crate::config::OrderPolicy;
use crate::persistence::{PendingOrder, StateStore};
use crate::types::Signal;

/// Events emitted by the execution engine
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    OrderFilled {
        instrument: String,
        quantity: i64,
        order_id: String,
        price: Option<f64>,
        position: i64,
    },
    /// Market closed; kept as a pending order
    OrderDeferred { instrument: String, quantity: i64 },
    /// Outside the trading window; discarded
    OrderDropped { instrument: String, quantity: i64 },
    OrderFailed {
        instrument: String,
        quantity: i64,
        reason: String,
    },
}

/// Result of handling one signal or pending order
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    NoAction,
    Filled {
        quantity: i64,
        position: i64,
        price: Option<f64>,
    },
    Deferred { quantity: i64 },
    Dropped { quantity: i64 },
    Failed { quantity: i64, error: BrokerError },
}

impl ExecutionOutcome {
    pub fn filled_quantity(&self) -> Option<i64> {
        match self {
            Self::Filled { quantity, .. } => Some(*quantity),
            _ => None,
        }
    }
}

pub struct ExecutionEngine {
    instance: String,
    session: SessionWindow,
    policy: OrderPolicy,
    tz: Tz,
    gateway: Arc<dyn OrderGateway>,
    store: Arc<StateStore>,
    journal: Option<Arc<FillJournal>>,
    book: Mutex<PositionBook>,
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEngine {
    pub fn new(
        instance: &str,
        session: SessionWindow,
        policy: OrderPolicy,
        tz: Tz,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<StateStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);

        Self {
            instance: instance.to_string(),
            session,
            policy,
            tz,
            gateway,
            store,
            journal: None,
            book: Mutex::new(PositionBook::default()),
            event_tx,
        }
    }

    /// Journal shared by every instance writing to the same file
    pub fn with_journal(mut self, journal: Arc<FillJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    pub fn session(&self) -> &SessionWindow {
        &self.session
    }

    fn book(&self) -> MutexGuard<'_, PositionBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Zero every configured instrument, then overlay the saved state
    pub fn restore<S: AsRef<str>>(&self, instruments: &[S]) {
        let saved = self.store.load(&self.instance);
        let mut book = PositionBook::new(instruments);
        book.restore(&saved);

        info!(
            instance = %self.instance,
            positions = ?book.positions(),
            pending = saved.pending_order_action.len(),
            "Restored position state"
        );
        *self.book() = book;
    }

    /// Flat book with nothing pending; saved state is not read
    pub fn reset<S: AsRef<str>>(&self, instruments: &[S]) {
        *self.book() = PositionBook::new(instruments);
        info!(instance = %self.instance, "Starting from a flat book");
    }

    pub fn position(&self, instrument: &str) -> i64 {
        self.book().position(instrument)
    }

    pub fn positions(&self) -> BTreeMap<String, i64> {
        self.book().positions().clone()
    }

    pub fn has_pending(&self) -> bool {
        self.book().has_pending()
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.book().pending_orders()
    }

    pub fn is_pending(&self, instrument: &str) -> bool {
        self.book().pending(instrument).is_some()
    }

    /// Write the current book to the state store
    pub fn persist(&self) -> anyhow::Result<()> {
        let (positions, pending) = {
            let book = self.book();
            (book.positions().clone(), book.pending_orders())
        };
        self.store.save(&self.instance, &positions, &pending)
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist() {
            error!(instance = %self.instance, "Failed to persist state: {:#}", e);
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Size, gate and (maybe) submit an order for a strategy signal.
    /// `now` is venue-local time.
    pub async fn handle_signal(
        &self,
        instrument: &str,
        signal: Signal,
        lot_size: i64,
        now: NaiveDateTime,
    ) -> ExecutionOutcome {
        let quantity = self.book().order_quantity(instrument, signal, lot_size);
        if quantity == 0 {
            return ExecutionOutcome::NoAction;
        }

        match self.session.gate(now.time()) {
            GateDecision::Defer => {
                let order = PendingOrder {
                    instrument: instrument.to_string(),
                    order_qty: quantity,
                    update_time: local_to_utc(self.tz, now),
                };
                if let Some(replaced) = self.book().set_pending(order) {
                    debug!(instrument, replaced = replaced.order_qty, "Pending order replaced");
                }
                info!(
                    instrument,
                    quantity, "Market closed at {}, order kept pending", now.time()
                );
                self.persist_or_log();
                self.emit(ExecutionEvent::OrderDeferred {
                    instrument: instrument.to_string(),
                    quantity,
                });
                ExecutionOutcome::Deferred { quantity }
            }
            GateDecision::Drop => {
                debug!(
                    instrument,
                    quantity, "Outside trading window at {}, order dropped", now.time()
                );
                self.emit(ExecutionEvent::OrderDropped {
                    instrument: instrument.to_string(),
                    quantity,
                });
                ExecutionOutcome::Dropped { quantity }
            }
            GateDecision::Submit => self.submit(instrument, quantity, now).await,
        }
    }

    /// Retry an instrument's pending order if the market is open.
    ///
    /// A transport failure keeps the order pending for the next cycle, up to
    /// `max_submit_attempts` cycles. A venue rejection, or running out of
    /// cycles, abandons the order.
    pub async fn resubmit_pending(&self, instrument: &str, now: NaiveDateTime) -> ExecutionOutcome {
        let Some(order) = self.book().pending(instrument).cloned() else {
            return ExecutionOutcome::NoAction;
        };

        if !self.session.in_market_hours(now.time()) {
            debug!(instrument, "Market still closed, order stays pending");
            return ExecutionOutcome::Deferred {
                quantity: order.order_qty,
            };
        }

        info!(
            instrument,
            quantity = order.order_qty,
            created = %order.update_time,
            "Resubmitting pending order"
        );

        let outcome = self.submit(instrument, order.order_qty, now).await;
        match &outcome {
            ExecutionOutcome::Filled { .. } => {
                self.book().clear_pending(instrument);
                self.persist_or_log();
            }
            ExecutionOutcome::Failed { quantity, error } => {
                let failures = self.book().record_pending_failure(instrument);
                let limit = self.policy.max_submit_attempts.max(1);
                if error.is_retryable() && failures < limit {
                    warn!(
                        instrument,
                        quantity, "Pending order failed ({}/{}), kept for the next cycle", failures, limit
                    );
                } else {
                    error!(
                        instrument,
                        quantity, failures, "Abandoning pending order: {}", error
                    );
                    self.book().clear_pending(instrument);
                    self.persist_or_log();
                    self.emit(ExecutionEvent::OrderDropped {
                        instrument: instrument.to_string(),
                        quantity: *quantity,
                    });
                }
            }
            _ => {}
        }
        outcome
    }

    async fn submit(&self, instrument: &str, quantity: i64, now: NaiveDateTime) -> ExecutionOutcome {
        let created_at = local_to_utc(self.tz, now);
        let Some(order) =
            OrderRequest::market(instrument, quantity, &self.policy.product_type, created_at)
        else {
            return ExecutionOutcome::NoAction;
        };

        match self.place_with_retry(&order).await {
            Ok(ack) => self.record_fill(&order, &ack, created_at),
            Err(e) => {
                error!(instrument, quantity, "Order failed: {}", e);
                self.emit(ExecutionEvent::OrderFailed {
                    instrument: instrument.to_string(),
                    quantity,
                    reason: e.to_string(),
                });
                ExecutionOutcome::Failed { quantity, error: e }
            }
        }
    }

    async fn place_with_retry(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        let attempts = self.policy.max_submit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.gateway.place_order(order).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let backoff = Duration::from_millis(self.policy.retry_backoff_ms * u64::from(attempt));
                    warn!(
                        instrument = %order.instrument,
                        "Order attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_fill(
        &self,
        order: &OrderRequest,
        ack: &OrderAck,
        timestamp: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let quantity = order.signed_quantity();
        let position = self.book().apply_fill(&order.instrument, quantity);

        info!(
            instrument = %order.instrument,
            order_id = %ack.order_id,
            "Market order {} {} x{} acknowledged, position now {}",
            ack.order_id, order.side, order.quantity, position
        );

        self.persist_or_log();

        if let Some(journal) = &self.journal {
            let record = FillRecord {
                timestamp,
                instance: self.instance.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                quantity: order.quantity,
                order_id: ack.order_id.clone(),
                price: ack.fill_price,
                position_after: position,
            };
            if let Err(e) = journal.record(&record) {
                warn!("Failed to journal fill: {:#}", e);
            }
        }

        self.emit(ExecutionEvent::OrderFilled {
            instrument: order.instrument.clone(),
            quantity,
            order_id: ack.order_id.clone(),
            price: ack.fill_price,
            position,
        });

        ExecutionOutcome::Filled {
            quantity,
            position,
            price: ack.fill_price,
        }
    }
}
