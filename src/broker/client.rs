//! Venue REST client
//!
//! Authenticates every request with an `app_id:access_token` header. Token
//! issuance happens outside this process; an expired token surfaces as
//! `BrokerError::Authentication`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use super::models::{HistoryQuery, HistoryResponse, PlaceOrderBody, PlaceOrderResponse};
use super::{BrokerError, BrokerResult, CandleRequest, CandleSource, OrderGateway};
use crate::execution::{OrderAck, OrderRequest};
use crate::types::Candle;

pub const DEFAULT_API_URL: &str = "https://api-t1.fyers.in";
pub const DEFAULT_DATA_URL: &str = "https://api-t1.fyers.in";

pub struct RestBroker {
    client: Client,
    api_url: String,
    data_url: String,
    app_id: String,
    access_token: String,
}

impl RestBroker {
    /// Create a client from environment variables
    ///
    /// Expects:
    /// - `BROKER_APP_ID` - Application ID registered with the venue
    /// - `BROKER_ACCESS_TOKEN` - Access token issued for the app
    /// - `BROKER_API_URL` (optional) - Order API base URL
    /// - `BROKER_DATA_URL` (optional) - History API base URL
    pub fn from_env() -> Result<Self> {
        let app_id =
            std::env::var("BROKER_APP_ID").context("BROKER_APP_ID environment variable not set")?;
        let access_token = std::env::var("BROKER_ACCESS_TOKEN")
            .context("BROKER_ACCESS_TOKEN environment variable not set")?;
        let api_url = std::env::var("BROKER_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let data_url =
            std::env::var("BROKER_DATA_URL").unwrap_or_else(|_| DEFAULT_DATA_URL.to_string());

        Self::new(app_id, access_token, api_url, data_url)
    }

    pub fn new(
        app_id: String,
        access_token: String,
        api_url: String,
        data_url: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        info!("Venue REST client ready (api: {}, data: {})", api_url, data_url);

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            app_id,
            access_token,
        })
    }

    fn auth_header(&self) -> String {
        format!("{}:{}", self.app_id, self.access_token)
    }

    /// Read a response body, mapping HTTP failures onto broker errors
    async fn read_body(response: reqwest::Response) -> BrokerResult<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        match status {
            s if s.is_success() => Ok(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(BrokerError::Authentication(format!("{}: {}", status, body)))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(BrokerError::Transport(format!("{}: {}", status, body)))
            }
            // 4xx bodies still carry the venue's error payload
            _ => Ok(body),
        }
    }
}

#[async_trait]
impl CandleSource for RestBroker {
    async fn fetch_candles(&self, request: &CandleRequest) -> BrokerResult<Vec<Candle>> {
        let query = HistoryQuery {
            symbol: request.instrument.clone(),
            resolution: request.resolution.to_string(),
            date_format: "0".to_string(),
            range_from: request.range_from.timestamp().to_string(),
            range_to: request.range_to.timestamp().to_string(),
            cont_flag: "1".to_string(),
        };

        debug!(
            instrument = %request.instrument,
            from = %request.range_from,
            to = %request.range_to,
            "Fetching candles"
        );

        let response = self
            .client
            .get(format!("{}/data/history", self.data_url))
            .header("Authorization", self.auth_header())
            .query(&query)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let body = Self::read_body(response).await?;
        let history: HistoryResponse =
            serde_json::from_str(&body).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        if !history.is_ok() {
            return Err(BrokerError::Rejected(
                history.message.unwrap_or_else(|| "history request failed".to_string()),
            ));
        }

        Ok(history.into_candles())
    }
}

#[async_trait]
impl OrderGateway for RestBroker {
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck> {
        let body = PlaceOrderBody::from(order);

        info!(
            "Placing {} {} x{} ({})",
            order.side, order.instrument, order.quantity, body.order_tag
        );

        let response = self
            .client
            .post(format!("{}/api/v3/orders/sync", self.api_url))
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let text = Self::read_body(response).await?;
        let placed: PlaceOrderResponse =
            serde_json::from_str(&text).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        if !placed.is_ok() {
            return Err(BrokerError::Rejected(placed.to_string()));
        }

        Ok(OrderAck {
            order_id: placed.id.unwrap_or_else(|| body.order_tag.clone()),
            fill_price: None,
        })
    }
}
