//! In-memory venue for backtests and tests
//!
//! Orders fill immediately at the close of the latest candle at or before the
//! order's timestamp, falling back to the last candle fetched upstream.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{BrokerError, BrokerResult, CandleRequest, CandleSource, OrderGateway};
use crate::execution::{OrderAck, OrderRequest};
use crate::types::Candle;

#[derive(Default)]
pub struct PaperBroker {
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    orders: Mutex<Vec<OrderRequest>>,
    order_failures: Mutex<VecDeque<BrokerError>>,
    fetch_failures: Mutex<HashSet<String>>,
    /// Candle source used when no local candles exist for an instrument
    upstream: Option<Arc<dyn CandleSource>>,
    last_upstream: Mutex<HashMap<String, Candle>>,
    next_id: AtomicU64,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill orders locally but read candles from another source
    pub fn with_upstream(upstream: Arc<dyn CandleSource>) -> Self {
        Self {
            upstream: Some(upstream),
            ..Self::default()
        }
    }

    pub fn insert_candles(&self, instrument: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        self.lock_candles().insert(instrument.to_string(), candles);
    }

    /// Queue an error for the next order submission
    pub fn fail_next_order(&self, error: BrokerError) {
        self.order_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Make every fetch for `instrument` fail
    pub fn fail_fetches(&self, instrument: &str) {
        self.fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instrument.to_string());
    }

    /// Orders accepted so far
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_candles(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Candle>>> {
        self.candles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fill_price(&self, order: &OrderRequest) -> Option<f64> {
        let local = self.lock_candles().get(&order.instrument).and_then(|candles| {
            candles
                .iter()
                .rev()
                .find(|c| c.timestamp <= order.created_at)
                .map(|c| c.close)
        });
        local.or_else(|| {
            self.last_upstream
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&order.instrument)
                .map(|c| c.close)
        })
    }
}

#[async_trait]
impl CandleSource for PaperBroker {
    async fn fetch_candles(&self, request: &CandleRequest) -> BrokerResult<Vec<Candle>> {
        if self
            .fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&request.instrument)
        {
            return Err(BrokerError::Transport(format!(
                "simulated fetch failure for {}",
                request.instrument
            )));
        }

        let local = self.lock_candles().get(&request.instrument).map(|candles| {
            candles
                .iter()
                .filter(|c| c.timestamp >= request.range_from && c.timestamp <= request.range_to)
                .copied()
                .collect::<Vec<_>>()
        });

        match (local, &self.upstream) {
            (Some(candles), _) => Ok(candles),
            (None, Some(upstream)) => {
                let candles = upstream.fetch_candles(request).await?;
                if let Some(last) = candles.last() {
                    self.last_upstream
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(request.instrument.clone(), *last);
                }
                Ok(candles)
            }
            (None, None) => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl OrderGateway for PaperBroker {
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck> {
        let failure = self
            .order_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let fill_price = self.fill_price(order);
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(order.clone());

        Ok(OrderAck {
            order_id: format!("PAPER-{}", id),
            fill_price,
        })
    }
}
