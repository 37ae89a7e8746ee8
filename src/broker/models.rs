//! Venue REST request and response bodies

use serde::{Deserialize, Serialize};

use crate::execution::OrderRequest;
use crate::types::Candle;

/// Query string for `GET /data/history`
#[derive(Debug, Serialize)]
pub struct HistoryQuery {
    pub symbol: String,
    pub resolution: String,
    /// 0 = ranges given as unix seconds
    pub date_format: String,
    pub range_from: String,
    pub range_to: String,
    pub cont_flag: String,
}

/// `{"s": "ok", "candles": [[ts, o, h, l, c, v], ...]}`
#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub s: String,
    #[serde(default)]
    pub candles: Vec<Vec<f64>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HistoryResponse {
    pub fn is_ok(&self) -> bool {
        self.s == "ok"
    }

    /// Rows that do not have all six fields are skipped
    pub fn into_candles(self) -> Vec<Candle> {
        self.candles
            .iter()
            .filter_map(|row| Candle::from_row(row))
            .collect()
    }
}

/// Body for `POST /api/v3/orders/sync`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderBody {
    pub symbol: String,
    pub qty: u64,
    /// 2 = market
    #[serde(rename = "type")]
    pub order_type: u8,
    /// 1 = buy, -1 = sell
    pub side: i64,
    pub product_type: String,
    pub limit_price: f64,
    pub stop_price: f64,
    pub disclosed_qty: u64,
    pub validity: String,
    pub offline_order: bool,
    pub order_tag: String,
}

impl From<&OrderRequest> for PlaceOrderBody {
    fn from(order: &OrderRequest) -> Self {
        Self {
            symbol: order.instrument.clone(),
            qty: order.quantity,
            order_type: 2,
            side: order.side.sign(),
            product_type: order.product_type.clone(),
            limit_price: 0.0,
            stop_price: 0.0,
            disclosed_qty: 0,
            validity: "DAY".to_string(),
            offline_order: false,
            // Tags are alphanumeric only
            order_tag: order.id.simple().to_string(),
        }
    }
}

/// `{"s": "ok", "code": 1101, "message": "...", "id": "..."}`
#[derive(Debug, Deserialize)]
pub struct PlaceOrderResponse {
    pub s: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl PlaceOrderResponse {
    pub fn is_ok(&self) -> bool {
        self.s == "ok"
    }
}

impl std::fmt::Display for PlaceOrderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (code {})",
            self.message.as_deref().unwrap_or("no message"),
            self.code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_history_response_parsing() {
        let body = r#"{"s":"ok","candles":[[1690953600,10,12,9.5,11,1500],[1690954500,11,13,10,12]]}"#;
        let response: HistoryResponse = serde_json::from_str(body).unwrap();
        assert!(response.is_ok());

        let candles = response.into_candles();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 11.0);

        let error: HistoryResponse =
            serde_json::from_str(r#"{"s":"error","code":-300,"message":"Invalid symbol"}"#).unwrap();
        assert!(!error.is_ok());
        assert!(error.candles.is_empty());
    }

    #[test]
    fn test_place_order_body() {
        let order = OrderRequest::market("NSE:SBIN-EQ", -6, "MARGIN", Utc::now()).unwrap();
        let body = serde_json::to_value(PlaceOrderBody::from(&order)).unwrap();

        assert_eq!(body["symbol"], "NSE:SBIN-EQ");
        assert_eq!(body["qty"], 6);
        assert_eq!(body["type"], 2);
        assert_eq!(body["side"], -1);
        assert_eq!(body["productType"], "MARGIN");
        assert_eq!(body["validity"], "DAY");
        assert_eq!(body["orderTag"].as_str().unwrap().len(), 32);
    }
}
