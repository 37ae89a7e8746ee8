//! Trend-flip signal engine
//!
//! Volatility bands around the high/low midpoint with hysteresis: the band
//! under price can only ratchet up while price holds above it, the band over
//! price can only ratchet down while price holds below it. A close through
//! the opposite band flips the trend and emits a signal.

use serde::{Deserialize, Serialize};

use crate::types::{Candle, Signal};

/// How the volatility measure averages true range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityMode {
    /// Simple moving average over the last `period` candles
    #[default]
    Rolling,
    /// Expanding mean over every candle seen so far
    Expanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    pub period: usize,
    pub multiplier: f64,
    #[serde(default)]
    pub volatility_mode: VolatilityMode,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            period: 10,
            multiplier: 3.0,
            volatility_mode: VolatilityMode::Rolling,
        }
    }
}

impl TrendConfig {
    /// Candles needed before the volatility average is meaningful
    pub fn min_candles(&self) -> usize {
        self.period + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
}

/// Engine state after a candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendState {
    pub direction: TrendDirection,
    /// Band trailing under price (basis - M * vol)
    pub up_band: Option<f64>,
    /// Band trailing over price (basis + M * vol)
    pub down_band: Option<f64>,
    pub prev_close: f64,
}

/// Per-candle diagnostic row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendPoint {
    pub basis: f64,
    pub true_range: f64,
    pub volatility: Option<f64>,
    pub up_band: Option<f64>,
    pub down_band: Option<f64>,
    pub direction: TrendDirection,
    pub signal: Signal,
}

/// Full evaluation of a candle window
#[derive(Debug, Clone, Default)]
pub struct TrendTrace {
    pub points: Vec<TrendPoint>,
}

impl TrendTrace {
    /// Signal at the last candle of the window
    pub fn last_signal(&self) -> Signal {
        self.points.last().map(|p| p.signal).unwrap_or(Signal::None)
    }

    pub fn last_direction(&self) -> Option<TrendDirection> {
        self.points.last().map(|p| p.direction)
    }

    pub fn signals(&self) -> impl Iterator<Item = (usize, Signal)> + '_ {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.signal != Signal::None)
            .map(|(i, p)| (i, p.signal))
    }
}

/// Incremental trend engine. `evaluate` recomputes a whole window from
/// scratch; `update` carries band state across calls.
#[derive(Debug, Clone)]
pub struct TrendEngine {
    config: TrendConfig,
    state: Option<TrendState>,
    ranges: Vec<f64>,
    range_sum: f64,
    seen: usize,
}

impl TrendEngine {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            state: None,
            ranges: Vec::with_capacity(config.period),
            range_sum: 0.0,
            seen: 0,
        }
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    pub fn state(&self) -> Option<&TrendState> {
        self.state.as_ref()
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.ranges.clear();
        self.range_sum = 0.0;
        self.seen = 0;
    }

    /// Evaluate a full window from a clean state
    pub fn evaluate(config: TrendConfig, candles: &[Candle]) -> TrendTrace {
        let mut engine = Self::new(config);
        TrendTrace {
            points: candles.iter().map(|c| engine.update(c)).collect(),
        }
    }

    fn push_range(&mut self, true_range: f64) -> Option<f64> {
        self.seen += 1;
        match self.config.volatility_mode {
            VolatilityMode::Rolling => {
                let period = self.config.period.max(1);
                self.ranges.push(true_range);
                if self.ranges.len() > period {
                    self.ranges.remove(0);
                }
                (self.ranges.len() == period)
                    .then(|| self.ranges.iter().sum::<f64>() / period as f64)
            }
            VolatilityMode::Expanding => {
                self.range_sum += true_range;
                Some(self.range_sum / self.seen as f64)
            }
        }
    }

    /// Feed the next candle
    pub fn update(&mut self, candle: &Candle) -> TrendPoint {
        let basis = (candle.high + candle.low) / 2.0;
        let prev = self.state;

        let true_range = match prev {
            Some(prev) => (candle.high - candle.low)
                .max((candle.high - prev.prev_close).abs())
                .max((candle.low - prev.prev_close).abs()),
            None => candle.high - candle.low,
        };

        let volatility = self.push_range(true_range);
        let m = self.config.multiplier;
        let raw_up = volatility.map(|v| basis - m * v);
        let raw_down = volatility.map(|v| basis + m * v);

        let Some(prev) = prev else {
            let point = TrendPoint {
                basis,
                true_range,
                volatility,
                up_band: raw_up,
                down_band: raw_down,
                direction: TrendDirection::Up,
                signal: Signal::None,
            };
            self.state = Some(TrendState {
                direction: TrendDirection::Up,
                up_band: raw_up,
                down_band: raw_down,
                prev_close: candle.close,
            });
            return point;
        };

        let up_band = match (raw_up, prev.up_band) {
            (Some(raw), Some(prev_up)) if prev.prev_close > prev_up => Some(raw.max(prev_up)),
            (raw, _) => raw,
        };
        let down_band = match (raw_down, prev.down_band) {
            (Some(raw), Some(prev_down)) if prev.prev_close < prev_down => Some(raw.min(prev_down)),
            (raw, _) => raw,
        };

        let (direction, signal) = match (prev.direction, prev.up_band, prev.down_band) {
            (TrendDirection::Down, _, Some(prev_down)) if candle.close > prev_down => {
                (TrendDirection::Up, Signal::Buy)
            }
            (TrendDirection::Up, Some(prev_up), _) if candle.close < prev_up => {
                (TrendDirection::Down, Signal::Sell)
            }
            (direction, _, _) => (direction, Signal::None),
        };

        self.state = Some(TrendState {
            direction,
            up_band,
            down_band,
            prev_close: candle.close,
        });

        TrendPoint {
            basis,
            true_range,
            volatility,
            up_band,
            down_band,
            direction,
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn candle(i: usize, high: f64, low: f64, close: f64) -> Candle {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        Candle {
            timestamp: base + Duration::minutes(15 * i as i64),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    /// Candle with a fixed 2-point range centred on `close`
    fn bar(i: usize, close: f64) -> Candle {
        candle(i, close + 1.0, close - 1.0, close)
    }

    #[test]
    fn test_rising_series_never_sells() {
        let candles: Vec<Candle> = (0..60).map(|i| bar(i, 100.0 + i as f64 * 0.5)).collect();
        let config = TrendConfig {
            period: 5,
            multiplier: 2.0,
            volatility_mode: VolatilityMode::Rolling,
        };

        let trace = TrendEngine::evaluate(config, &candles);

        assert_eq!(trace.points.len(), 60);
        assert_eq!(trace.points[0].direction, TrendDirection::Up);
        assert!(trace.points.iter().all(|p| p.direction == TrendDirection::Up));
        assert!(trace.points.iter().all(|p| p.signal != Signal::Sell));
        assert_eq!(trace.signals().count(), 0);
        assert_eq!(trace.last_signal(), Signal::None);
    }

    #[test]
    fn test_scripted_flips() {
        // Range-2 candles, M = 1: once the window settles the bands sit at
        // close -/+ volatility.
        let closes = [
            100.0, 100.0, 100.0, 100.0, // flat, vol defined from i = 2
            96.0,  // i=4: 96 < up band of i=3 (98) -> SELL
            96.0, 96.0, 96.0, 96.0, 96.0, 96.0, // down band settles at 98
            99.0,  // i=11: 99 > down band of i=10 (98) -> BUY
            99.0, 99.0,
        ];
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i, c + 1.0, c - 1.0, c))
            .collect();
        let config = TrendConfig {
            period: 3,
            multiplier: 1.0,
            volatility_mode: VolatilityMode::Rolling,
        };

        let trace = TrendEngine::evaluate(config, &candles);
        let flips: Vec<(usize, Signal)> = trace.signals().collect();

        assert_eq!(flips, vec![(4, Signal::Sell), (11, Signal::Buy)]);
        assert_eq!(trace.last_direction(), Some(TrendDirection::Up));
    }

    #[test]
    fn test_bands_ratchet_with_trend() {
        let closes = [100.0, 100.0, 100.0, 101.0, 100.5];
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i, c))
            .collect();
        let config = TrendConfig {
            period: 3,
            multiplier: 1.0,
            volatility_mode: VolatilityMode::Rolling,
        };

        let trace = TrendEngine::evaluate(config, &candles);

        // i=2: first defined bands, TR window [2, 2, 2]
        assert_eq!(trace.points[2].up_band, Some(98.0));
        assert_eq!(trace.points[2].down_band, Some(102.0));
        // i=3: TR = max(2, |102-100|, |100-100|) = 2 -> raw up 99, price held above 98
        assert_eq!(trace.points[3].up_band, Some(99.0));
        // i=4: raw up 98.5 but the band may not loosen below 99
        assert_eq!(trace.points[4].up_band, Some(99.0));
        assert_eq!(trace.last_signal(), Signal::None);
    }

    #[test]
    fn test_short_window_does_not_flip() {
        // Huge drop, but the rolling average is never defined
        let candles = vec![bar(0, 100.0), bar(1, 50.0), bar(2, 10.0)];
        let config = TrendConfig {
            period: 10,
            ..TrendConfig::default()
        };

        let trace = TrendEngine::evaluate(config, &candles);

        assert!(trace.points.iter().all(|p| p.volatility.is_none()));
        assert_eq!(trace.last_signal(), Signal::None);
        assert!(TrendEngine::evaluate(config, &[]).points.is_empty());
    }

    #[test]
    fn test_expanding_mode_defines_volatility_immediately() {
        let candles = vec![bar(0, 100.0), bar(1, 100.0)];
        let config = TrendConfig {
            period: 10,
            multiplier: 1.0,
            volatility_mode: VolatilityMode::Expanding,
        };

        let trace = TrendEngine::evaluate(config, &candles);
        assert_eq!(trace.points[0].volatility, Some(2.0));
        assert_eq!(trace.points[1].up_band, Some(98.0));
    }

    #[test]
    fn test_incremental_matches_full_evaluation() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| bar(i, 100.0 + ((i as f64) * 0.7).sin() * 5.0))
            .collect();
        let config = TrendConfig {
            period: 4,
            multiplier: 1.5,
            volatility_mode: VolatilityMode::Rolling,
        };

        let full = TrendEngine::evaluate(config, &candles);
        let mut engine = TrendEngine::new(config);
        for (candle, expected) in candles.iter().zip(&full.points) {
            assert_eq!(&engine.update(candle), expected);
        }
    }
}
