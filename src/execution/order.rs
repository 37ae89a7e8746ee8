//! Order types sent to the venue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Side implied by a signed quantity; zero has no side
    pub fn from_quantity(quantity: i64) -> Option<Self> {
        match quantity.signum() {
            1 => Some(Self::Buy),
            -1 => Some(Self::Sell),
            _ => None,
        }
    }

    /// Venue encoding: 1 buy, -1 sell
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    /// Expires at the end of the trading day
    Day,
}

/// Market order for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side order ID, also sent as the order tag
    pub id: Uuid,
    pub instrument: String,
    pub side: OrderSide,
    /// Unsigned quantity; the side carries the direction
    pub quantity: u64,
    pub order_type: OrderType,
    pub validity: Validity,
    pub product_type: String,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    /// Build a market DAY order from a signed quantity. Zero yields `None`.
    pub fn market(
        instrument: &str,
        signed_quantity: i64,
        product_type: &str,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        let side = OrderSide::from_quantity(signed_quantity)?;
        Some(Self {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            side,
            quantity: signed_quantity.unsigned_abs(),
            order_type: OrderType::Market,
            validity: Validity::Day,
            product_type: product_type.to_string(),
            created_at,
        })
    }

    /// Positive for buys, negative for sells
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity as i64
    }
}

/// Venue acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Fill price when the venue reports one
    pub fill_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_quantity() {
        assert_eq!(OrderSide::from_quantity(5), Some(OrderSide::Buy));
        assert_eq!(OrderSide::from_quantity(-6), Some(OrderSide::Sell));
        assert_eq!(OrderSide::from_quantity(0), None);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn test_market_order_quantity() {
        let order = OrderRequest::market("NSE:SBIN-EQ", -6, "MARGIN", Utc::now()).unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 6);
        assert_eq!(order.signed_quantity(), -6);
        assert_eq!(order.validity, Validity::Day);

        assert!(OrderRequest::market("NSE:SBIN-EQ", 0, "MARGIN", Utc::now()).is_none());
    }
}
