//! Trading-instance configuration
//!
//! Instances are described in a JSON document:
//!
//! ```json
//! {
//!   "timezone": "Asia/Kolkata",
//!   "instances": [{
//!     "name": "reliance-trend",
//!     "enabled": true,
//!     "strategy": "trend_flip",
//!     "strategy_params": { "period": 10, "multiplier": 3.0, "volatility_mode": "rolling" },
//!     "lot_size": 1,
//!     "instruments": [{ "symbol": "NSE:RELIANCE-EQ", "interval": 15 }],
//!     "market_open": "09:15",
//!     "market_close": "15:30",
//!     "trading_start": "09:15",
//!     "trading_end": "15:15"
//!   }]
//! }
//! ```

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Reasons an instance refuses to start
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid parameters for strategy '{strategy}': {reason}")]
    StrategyParams { strategy: String, reason: String },

    #[error("invalid {field} '{value}': expected HH:MM")]
    MarketTime { field: &'static str, value: String },

    #[error("invalid session: {0}")]
    Session(String),

    #[error("invalid instrument '{symbol}': {reason}")]
    Instrument { symbol: String, reason: String },

    #[error("lot size must be positive, got {0}")]
    LotSize(i64),
}

/// Top-level config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// IANA name of the venue's timezone
    #[serde(default = "default_timezone")]
    pub timezone: String,

    pub instances: Vec<InstanceConfig>,
}

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

impl TraderConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

/// One trading instance: a strategy applied to a set of instruments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Strategy identifier (`trend_flip`, `weekly_breakout`)
    pub strategy: String,

    /// Strategy parameters, type-checked by the strategy during validation
    #[serde(default)]
    pub strategy_params: serde_json::Value,

    pub lot_size: i64,

    pub instruments: Vec<InstrumentConfig>,

    pub market_open: String,
    pub market_close: String,
    pub trading_start: String,
    pub trading_end: String,

    #[serde(default)]
    pub orders: OrderPolicy,

    /// Delay between simulated steps in backtest replay
    #[serde(default = "default_backtest_step_delay_ms")]
    pub backtest_step_delay_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_backtest_step_delay_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,

    /// Sampling interval in minutes
    pub interval: u32,

    /// Deliver live ticks for this instrument
    #[serde(default)]
    pub live_ticks: bool,
}

/// Order submission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPolicy {
    /// Attempts per order when the venue is unreachable
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,

    /// Base delay between attempts, multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Venue product type tag (e.g. MARGIN, INTRADAY, CNC)
    #[serde(default = "default_product_type")]
    pub product_type: String,
}

fn default_max_submit_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_product_type() -> String {
    "MARGIN".to_string()
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            max_submit_attempts: default_max_submit_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            product_type: default_product_type(),
        }
    }
}

/// Parse an `HH:MM` string
pub fn parse_hhmm(field: &'static str, value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ValidationError::MarketTime {
        field,
        value: value.to_string(),
    })
}

impl InstanceConfig {
    /// Validate everything except the strategy parameters
    pub fn validate_basics(&self) -> Result<(), ValidationError> {
        if self.lot_size <= 0 {
            return Err(ValidationError::LotSize(self.lot_size));
        }
        if self.instruments.is_empty() {
            return Err(ValidationError::Session("no instruments configured".to_string()));
        }
        for instrument in &self.instruments {
            if instrument.symbol.trim().is_empty() {
                return Err(ValidationError::Instrument {
                    symbol: instrument.symbol.clone(),
                    reason: "empty symbol".to_string(),
                });
            }
            if instrument.interval == 0 {
                return Err(ValidationError::Instrument {
                    symbol: instrument.symbol.clone(),
                    reason: "interval must be at least one minute".to_string(),
                });
            }
        }
        Ok(())
    }
}
