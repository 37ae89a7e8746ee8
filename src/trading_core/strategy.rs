//! Strategy interface and the trend-flip strategy
//!
//! Strategies are built from an identifier plus untyped JSON parameters, so
//! the parameter type checks happen here rather than in the config loader.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::breakout::WeeklyBreakoutStrategy;
use super::trend::{TrendConfig, TrendEngine, VolatilityMode};
use crate::config::ValidationError;
use crate::types::{Candle, Instrument, Signal, Tick};

/// A signal-producing trading strategy.
///
/// `process_tick`, `on_trade` and `on_order_abandoned` default to no-ops;
/// strategies that react to live ticks or track their own fills override
/// them.
pub trait Strategy: Send {
    /// Identifier used in configs and logs
    fn name(&self) -> &'static str;

    /// Range-check parameters
    fn validate(&self) -> Result<(), ValidationError>;

    /// One-time setup with the instance's instruments
    fn init(&mut self, _instruments: &[Instrument]) -> Result<(), ValidationError> {
        self.validate()
    }

    /// Closed candles needed per evaluation
    fn required_candles(&self) -> usize;

    /// Instruments that need live tick delivery
    fn live_instruments(&self, instruments: &[Instrument]) -> Vec<String> {
        instruments
            .iter()
            .filter(|i| i.live_ticks)
            .map(|i| i.symbol.clone())
            .collect()
    }

    /// Evaluate a freshly fetched candle window
    fn process_ohlc(&mut self, instrument: &str, candles: &[Candle]) -> Signal;

    /// React to a live tick; `now` is venue-local time
    fn process_tick(&mut self, _tick: &Tick, _now: NaiveDateTime) -> Signal {
        Signal::None
    }

    /// Notification of an acknowledged order (signed quantity)
    fn on_trade(&mut self, _instrument: &str, _quantity: i64, _price: Option<f64>) {}

    /// A signal for `instrument` will never fill: it was dropped, rejected,
    /// sized to nothing, or its pending order was given up
    fn on_order_abandoned(&mut self, _instrument: &str) {}
}

/// Build a strategy from its identifier and raw parameters
pub fn build_strategy(
    id: &str,
    params: &serde_json::Value,
) -> Result<Box<dyn Strategy>, ValidationError> {
    match id {
        TrendFlipStrategy::NAME => Ok(Box::new(TrendFlipStrategy::from_params(params)?)),
        WeeklyBreakoutStrategy::NAME => Ok(Box::new(WeeklyBreakoutStrategy::from_params(params)?)),
        other => Err(ValidationError::UnknownStrategy(other.to_string())),
    }
}

/// Deserialize strategy parameters, treating `null` as "all defaults"
pub(crate) fn parse_params<T>(strategy: &str, params: &serde_json::Value) -> Result<T, ValidationError>
where
    T: for<'de> Deserialize<'de>,
{
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| ValidationError::StrategyParams {
        strategy: strategy.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrendFlipParams {
    #[serde(default = "default_period", alias = "atr_period")]
    pub period: usize,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub volatility_mode: VolatilityMode,
}

fn default_period() -> usize {
    10
}

fn default_multiplier() -> f64 {
    3.0
}

/// Flips position on every trend reversal of the volatility bands
#[derive(Debug, Clone)]
pub struct TrendFlipStrategy {
    config: TrendConfig,
}

impl TrendFlipStrategy {
    pub const NAME: &'static str = "trend_flip";

    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Self, ValidationError> {
        let params: TrendFlipParams = parse_params(Self::NAME, params)?;
        Ok(Self::new(TrendConfig {
            period: params.period,
            multiplier: params.multiplier,
            volatility_mode: params.volatility_mode,
        }))
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }
}

impl Strategy for TrendFlipStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::StrategyParams {
            strategy: Self::NAME.to_string(),
            reason: reason.to_string(),
        };
        if self.config.period == 0 {
            return Err(invalid("period must be at least 1"));
        }
        if !self.config.multiplier.is_finite() || self.config.multiplier <= 0.0 {
            return Err(invalid("multiplier must be a positive number"));
        }
        Ok(())
    }

    fn required_candles(&self) -> usize {
        self.config.min_candles()
    }

    fn process_ohlc(&mut self, instrument: &str, candles: &[Candle]) -> Signal {
        let trace = TrendEngine::evaluate(self.config, candles);
        if let Some(point) = trace.points.last() {
            debug!(
                instrument,
                candles = candles.len(),
                direction = ?point.direction,
                up_band = ?point.up_band,
                down_band = ?point.down_band,
                "Trend evaluated"
            );
        }
        trace.last_signal()
    }
}
