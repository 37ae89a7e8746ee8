use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregated price bar over one sampling interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build from the venue's `[ts, open, high, low, close, volume]` row
    pub fn from_row(row: &[f64]) -> Option<Self> {
        if row.len() < 6 {
            return None;
        }
        let timestamp = DateTime::<Utc>::from_timestamp(row[0] as i64, 0)?;
        Some(Self {
            timestamp,
            open: row[1],
            high: row[2],
            low: row[3],
            close: row[4],
            volume: row[5],
        })
    }
}

/// A configured instrument and its fetch bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    /// Sampling interval in minutes
    pub interval_minutes: u32,
    /// Candles the strategy needs per evaluation
    pub lookback: usize,
    /// Deliver live ticks in addition to scheduled candles
    pub live_ticks: bool,
    pub last_fetch: Option<DateTime<Utc>>,
    pub next_fetch: Option<DateTime<Utc>>,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, interval_minutes: u32) -> Self {
        Self {
            symbol: symbol.into(),
            interval_minutes,
            lookback: 1,
            live_ticks: false,
            last_fetch: None,
            next_fetch: None,
        }
    }

    /// Record a completed fetch and when the next candle closes
    pub fn mark_fetched(&mut self, at: DateTime<Utc>) {
        self.last_fetch = Some(at);
        self.next_fetch = Some(at + chrono::Duration::minutes(i64::from(self.interval_minutes)));
    }
}

/// A single live market data update for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    /// Last traded price
    pub ltp: f64,
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
    /// Venue payload as received
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Tick {
    /// Parse a venue feed message such as
    /// `{"symbol": "NSE:SBIN-EQ", "ltp": 606.4, "last_traded_time": 1690953622, ...}`.
    ///
    /// Returns `None` for control frames or messages without a symbol/price.
    pub fn from_feed_message(message: &serde_json::Value) -> Option<Self> {
        let instrument = message.get("symbol")?.as_str()?.to_string();
        let ltp = message.get("ltp")?.as_f64()?;
        let volume = message.get("vol_traded_today").and_then(|v| v.as_u64());
        let timestamp = message
            .get("last_traded_time")
            .or_else(|| message.get("exch_feed_time"))
            .and_then(|v| v.as_i64())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        Some(Self {
            instrument,
            ltp,
            volume,
            timestamp,
            raw: message.clone(),
        })
    }
}

/// Directional output of a strategy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    None,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::None => write!(f, "NONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candle_from_row() {
        let candle = Candle::from_row(&[1_690_953_600.0, 10.0, 12.0, 9.5, 11.0, 1500.0]).unwrap();
        assert_eq!(candle.timestamp.timestamp(), 1_690_953_600);
        assert_eq!(candle.high, 12.0);
        assert_eq!(candle.volume, 1500.0);

        assert!(Candle::from_row(&[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_tick_from_feed_message() {
        let message = json!({
            "ltp": 606.4,
            "vol_traded_today": 3045212,
            "last_traded_time": 1690953622,
            "type": "sf",
            "symbol": "NSE:SBIN-EQ"
        });

        let tick = Tick::from_feed_message(&message).unwrap();
        assert_eq!(tick.instrument, "NSE:SBIN-EQ");
        assert_eq!(tick.ltp, 606.4);
        assert_eq!(tick.volume, Some(3045212));
        assert_eq!(tick.timestamp.timestamp(), 1690953622);

        // Control frames carry no symbol
        assert!(Tick::from_feed_message(&json!({"type": "cn", "code": 200})).is_none());
    }
}
