//! Window-high breakout strategy
//!
//! Candle fetches only refresh the high of the lookback window; entries come
//! from live ticks that trade through that high inside a late-session entry
//! window.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::strategy::{parse_params, Strategy};
use crate::config::{parse_hhmm, ValidationError};
use crate::types::{Candle, Instrument, Signal, Tick};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeeklyBreakoutParams {
    /// Candles in the high-water window
    pub breakout_period: i64,
    /// Maximum instruments holding a position at once
    pub max_stocks_to_execute: f64,
    #[serde(default = "default_entry_start")]
    pub entry_start: String,
    #[serde(default = "default_entry_end")]
    pub entry_end: String,
}

fn default_entry_start() -> String {
    "15:15".to_string()
}

fn default_entry_end() -> String {
    "15:30".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowHigh {
    pub value: f64,
    pub last_updated: DateTime<Utc>,
}

/// Position as seen by the strategy, built from `on_trade` notifications
#[derive(Debug, Clone, PartialEq)]
pub struct BreakoutPosition {
    pub instrument: String,
    pub entry_quantity: i64,
    pub exit_quantity: i64,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl BreakoutPosition {
    fn is_closed(&self) -> bool {
        self.entry_quantity != 0 && self.entry_quantity == self.exit_quantity
    }
}

fn blend(avg: f64, qty: i64, price: f64, add: i64) -> f64 {
    (avg * qty as f64 + price * add as f64) / (qty + add) as f64
}

pub struct WeeklyBreakoutStrategy {
    params: WeeklyBreakoutParams,
    entry_window: Option<(NaiveTime, NaiveTime)>,
    window_highs: HashMap<String, WindowHigh>,
    /// Signalled but not yet acknowledged, so ticks don't re-fire
    entries_in_flight: HashMap<String, DateTime<Utc>>,
    ongoing: HashMap<String, BreakoutPosition>,
    closed: HashMap<String, Vec<BreakoutPosition>>,
}

impl WeeklyBreakoutStrategy {
    pub const NAME: &'static str = "weekly_breakout";

    pub fn from_params(params: &serde_json::Value) -> Result<Self, ValidationError> {
        let params: WeeklyBreakoutParams = parse_params(Self::NAME, params)?;
        Ok(Self {
            params,
            entry_window: None,
            window_highs: HashMap::new(),
            entries_in_flight: HashMap::new(),
            ongoing: HashMap::new(),
            closed: HashMap::new(),
        })
    }

    pub fn window_high(&self, instrument: &str) -> Option<f64> {
        self.window_highs.get(instrument).map(|h| h.value)
    }

    pub fn ongoing_position(&self, instrument: &str) -> Option<&BreakoutPosition> {
        self.ongoing.get(instrument)
    }

    pub fn closed_positions(&self, instrument: &str) -> &[BreakoutPosition] {
        self.closed.get(instrument).map(Vec::as_slice).unwrap_or(&[])
    }

    fn in_entry_window(&self, now: NaiveDateTime) -> bool {
        match self.entry_window {
            Some((start, end)) => now.time() >= start && now.time() <= end,
            None => false,
        }
    }

    fn close_position(&mut self, instrument: &str) {
        if let Some(mut position) = self.ongoing.remove(instrument) {
            position.closed_at = Some(Utc::now());
            info!(
                instrument,
                entry = position.avg_entry_price,
                exit = position.avg_exit_price,
                "Breakout position closed"
            );
            self.closed
                .entry(instrument.to_string())
                .or_default()
                .push(position);
        }
    }
}

impl Strategy for WeeklyBreakoutStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::StrategyParams {
            strategy: Self::NAME.to_string(),
            reason,
        };
        if self.params.breakout_period < 1 {
            return Err(invalid("breakout_period must be at least 1".to_string()));
        }
        if !self.params.max_stocks_to_execute.is_finite() || self.params.max_stocks_to_execute <= 0.0 {
            return Err(invalid("max_stocks_to_execute must be a positive number".to_string()));
        }
        let start = parse_hhmm("entry_start", &self.params.entry_start)?;
        let end = parse_hhmm("entry_end", &self.params.entry_end)?;
        if start > end {
            return Err(invalid(format!(
                "entry window {} - {} is inverted",
                self.params.entry_start, self.params.entry_end
            )));
        }
        Ok(())
    }

    fn init(&mut self, instruments: &[Instrument]) -> Result<(), ValidationError> {
        self.validate()?;
        self.entry_window = Some((
            parse_hhmm("entry_start", &self.params.entry_start)?,
            parse_hhmm("entry_end", &self.params.entry_end)?,
        ));
        // No breakout until a real window high has been fetched
        let now = Utc::now();
        for instrument in instruments {
            self.window_highs.insert(
                instrument.symbol.clone(),
                WindowHigh {
                    value: f64::INFINITY,
                    last_updated: now,
                },
            );
        }
        Ok(())
    }

    fn required_candles(&self) -> usize {
        self.params.breakout_period.max(1) as usize
    }

    fn live_instruments(&self, instruments: &[Instrument]) -> Vec<String> {
        instruments.iter().map(|i| i.symbol.clone()).collect()
    }

    fn process_ohlc(&mut self, instrument: &str, candles: &[Candle]) -> Signal {
        let window = &candles[candles.len().saturating_sub(self.required_candles())..];
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        if high.is_finite() {
            debug!(instrument, high, "Window high refreshed");
            self.window_highs.insert(
                instrument.to_string(),
                WindowHigh {
                    value: high,
                    last_updated: Utc::now(),
                },
            );
        }
        Signal::None
    }

    fn process_tick(&mut self, tick: &Tick, now: NaiveDateTime) -> Signal {
        if !self.in_entry_window(now) {
            return Signal::None;
        }
        if self.ongoing.contains_key(&tick.instrument)
            || self.entries_in_flight.contains_key(&tick.instrument)
        {
            return Signal::None;
        }
        let holding = self.ongoing.len() + self.entries_in_flight.len();
        if holding as f64 >= self.params.max_stocks_to_execute {
            return Signal::None;
        }

        match self.window_highs.get(&tick.instrument) {
            Some(high) if tick.ltp > high.value => {
                info!(
                    instrument = %tick.instrument,
                    ltp = tick.ltp,
                    high = high.value,
                    "Window high broken"
                );
                self.entries_in_flight.insert(tick.instrument.clone(), tick.timestamp);
                Signal::Buy
            }
            _ => Signal::None,
        }
    }

    fn on_order_abandoned(&mut self, instrument: &str) {
        if self.entries_in_flight.remove(instrument).is_some() {
            debug!(instrument, "Entry abandoned, slot released");
        }
    }

    fn on_trade(&mut self, instrument: &str, quantity: i64, price: Option<f64>) {
        self.entries_in_flight.remove(instrument);
        let price = price.unwrap_or(0.0);

        let Some(position) = self.ongoing.get_mut(instrument) else {
            if quantity > 0 {
                self.ongoing.insert(
                    instrument.to_string(),
                    BreakoutPosition {
                        instrument: instrument.to_string(),
                        entry_quantity: quantity,
                        exit_quantity: 0,
                        avg_entry_price: price,
                        avg_exit_price: 0.0,
                        opened_at: Utc::now(),
                        closed_at: None,
                    },
                );
            }
            return;
        };

        if quantity > 0 {
            position.avg_entry_price =
                blend(position.avg_entry_price, position.entry_quantity, price, quantity);
            position.entry_quantity += quantity;
        } else {
            let qty = quantity.abs();
            position.avg_exit_price = blend(position.avg_exit_price, position.exit_quantity, price, qty);
            position.exit_quantity += qty;
        }

        if position.is_closed() {
            self.close_position(instrument);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use serde_json::json;

    fn strategy() -> WeeklyBreakoutStrategy {
        let mut s = WeeklyBreakoutStrategy::from_params(&json!({
            "breakout_period": 3,
            "max_stocks_to_execute": 1
        }))
        .unwrap();
        s.init(&[Instrument::new("NSE:SBIN-EQ", 15), Instrument::new("NSE:TCS-EQ", 15)])
            .unwrap();
        s
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 6).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn tick(instrument: &str, ltp: f64) -> Tick {
        Tick {
            instrument: instrument.to_string(),
            ltp,
            volume: None,
            timestamp: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    fn candles(highs: &[f64]) -> Vec<Candle> {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        highs
            .iter()
            .enumerate()
            .map(|(i, &h)| Candle {
                timestamp: base + Duration::minutes(15 * i as i64),
                open: h - 1.0,
                high: h,
                low: h - 2.0,
                close: h - 0.5,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn test_validation() {
        let s = WeeklyBreakoutStrategy::from_params(&json!({
            "breakout_period": 0,
            "max_stocks_to_execute": 1
        }))
        .unwrap();
        assert!(s.validate().is_err());

        // Type check: breakout_period must be an integer
        assert!(WeeklyBreakoutStrategy::from_params(&json!({
            "breakout_period": 2.5,
            "max_stocks_to_execute": 1
        }))
        .is_err());

        let s = WeeklyBreakoutStrategy::from_params(&json!({
            "breakout_period": 5,
            "max_stocks_to_execute": 2,
            "entry_start": "15:30",
            "entry_end": "15:15"
        }))
        .unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_no_breakout_before_window_high_known() {
        let mut s = strategy();
        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 1e9), at(15, 20)), Signal::None);
    }

    #[test]
    fn test_breakout_inside_entry_window_only() {
        let mut s = strategy();
        // Only the last 3 highs count
        assert_eq!(s.process_ohlc("NSE:SBIN-EQ", &candles(&[900.0, 600.0, 610.0, 605.0])), Signal::None);
        assert_eq!(s.window_high("NSE:SBIN-EQ"), Some(610.0));

        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 611.0), at(14, 0)), Signal::None);
        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 609.0), at(15, 20)), Signal::None);
        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 611.0), at(15, 20)), Signal::Buy);
        // Already in flight
        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 612.0), at(15, 21)), Signal::None);
    }

    #[test]
    fn test_max_stocks_limits_entries() {
        let mut s = strategy();
        s.process_ohlc("NSE:SBIN-EQ", &candles(&[100.0]));
        s.process_ohlc("NSE:TCS-EQ", &candles(&[200.0]));

        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 101.0), at(15, 20)), Signal::Buy);
        assert_eq!(s.process_tick(&tick("NSE:TCS-EQ", 201.0), at(15, 20)), Signal::None);
    }

    #[test]
    fn test_on_trade_tracks_and_closes_positions() {
        let mut s = strategy();
        s.on_trade("NSE:SBIN-EQ", 2, Some(100.0));
        s.on_trade("NSE:SBIN-EQ", 2, Some(110.0));
        let position = s.ongoing_position("NSE:SBIN-EQ").unwrap();
        assert_eq!(position.entry_quantity, 4);
        assert_eq!(position.avg_entry_price, 105.0);

        s.on_trade("NSE:SBIN-EQ", -4, Some(120.0));
        assert!(s.ongoing_position("NSE:SBIN-EQ").is_none());
        let closed = s.closed_positions("NSE:SBIN-EQ");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].avg_exit_price, 120.0);
        assert!(closed[0].closed_at.is_some());
    }

    #[test]
    fn test_abandoned_entry_releases_slot() {
        let mut s = strategy();
        s.process_ohlc("NSE:SBIN-EQ", &candles(&[100.0]));
        s.process_ohlc("NSE:TCS-EQ", &candles(&[200.0]));

        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 101.0), at(15, 20)), Signal::Buy);
        s.on_order_abandoned("NSE:SBIN-EQ");

        // Both the instrument and the max_stocks slot are free again
        assert_eq!(s.process_tick(&tick("NSE:TCS-EQ", 201.0), at(15, 21)), Signal::Buy);
        s.on_order_abandoned("NSE:TCS-EQ");
        assert_eq!(s.process_tick(&tick("NSE:SBIN-EQ", 102.0), at(15, 22)), Signal::Buy);
    }
}
