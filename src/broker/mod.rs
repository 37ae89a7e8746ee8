//! Venue seam: candle history and order submission
//!
//! - `RestBroker` talks to the venue's REST API
//! - `PaperBroker` keeps candles and orders in memory for backtests and tests

mod client;
mod models;
mod paper;

pub use client::RestBroker;
pub use models::{HistoryResponse, PlaceOrderBody, PlaceOrderResponse};
pub use paper::PaperBroker;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::execution::{OrderAck, OrderRequest};
use crate::types::Candle;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// Network failures, timeouts and venue 5xx responses
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The venue refused the request
    #[error("rejected by venue: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Only transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Candle history query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleRequest {
    pub instrument: String,
    /// Candle resolution in minutes
    pub resolution: u32,
    pub range_from: DateTime<Utc>,
    pub range_to: DateTime<Utc>,
}

impl CandleRequest {
    /// Range ending at `now` that covers `lookback` candles even across
    /// overnight and weekend gaps, given the venue is open `session_minutes`
    /// per day.
    pub fn recent(
        instrument: &str,
        resolution: u32,
        lookback: usize,
        session_minutes: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let needed_minutes = (lookback as i64 + 1) * i64::from(resolution.max(1));
        let sessions = (needed_minutes + session_minutes.max(1) - 1) / session_minutes.max(1);
        // Weekend plus one holiday
        let days = sessions + 3;

        Self {
            instrument: instrument.to_string(),
            resolution,
            range_from: now - Duration::days(days),
            range_to: now,
        }
    }
}

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles within the requested range, oldest first
    async fn fetch_candles(&self, request: &CandleRequest) -> BrokerResult<Vec<Candle>>;
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit an order; `Ok` means the venue accepted it
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_range_spans_enough_sessions() {
        let now = Utc::now();
        let request = CandleRequest::recent("NSE:SBIN-EQ", 15, 11, 375, now);
        assert_eq!(request.range_to, now);
        assert_eq!(now - request.range_from, Duration::days(4));

        // 200 fifteen-minute candles need eight sessions
        let request = CandleRequest::recent("NSE:SBIN-EQ", 15, 199, 375, now);
        assert_eq!(now - request.range_from, Duration::days(11));
    }

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(BrokerError::Transport("timeout".into()).is_retryable());
        assert!(!BrokerError::Rejected("margin".into()).is_retryable());
        assert!(!BrokerError::Authentication("expired".into()).is_retryable());
    }
}
