//! Execution mode, clock and session gating

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::{parse_hhmm, InstanceConfig, ValidationError};
use crate::scheduler::{wall_clock, Clock};

/// Whether an instance trades against the live clock or replays history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Live,
    /// Replay the given number of past days
    Backtest { days: u32 },
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Backtest { days } => write!(f, "Backtest ({} days)", days),
        }
    }
}

/// Mode, venue timezone and time source, passed explicitly to each instance
#[derive(Clone)]
pub struct ExecutionContext {
    pub mode: ExecutionMode,
    pub tz: Tz,
    pub clock: Clock,
}

impl ExecutionContext {
    pub fn live(tz: Tz) -> Self {
        Self {
            mode: ExecutionMode::Live,
            tz,
            clock: wall_clock(tz),
        }
    }

    pub fn backtest(tz: Tz, days: u32) -> Self {
        Self {
            mode: ExecutionMode::Backtest { days },
            tz,
            clock: wall_clock(tz),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current venue-local time
    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        local_to_utc(self.tz, local)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("mode", &self.mode)
            .field("tz", &self.tz)
            .finish()
    }
}

/// Venue-local time to UTC. Nonexistent local times fall back to reading
/// the naive value as UTC.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

/// What to do with an order at a given time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Submit,
    /// Market closed: keep as a pending order
    Defer,
    /// Market open but outside the trading window: discard
    Drop,
}

/// Market hours and the narrower trading window inside them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub trading_start: NaiveTime,
    pub trading_end: NaiveTime,
}

impl SessionWindow {
    pub fn from_instance(config: &InstanceConfig) -> Result<Self, ValidationError> {
        let session = Self {
            market_open: parse_hhmm("market_open", &config.market_open)?,
            market_close: parse_hhmm("market_close", &config.market_close)?,
            trading_start: parse_hhmm("trading_start", &config.trading_start)?,
            trading_end: parse_hhmm("trading_end", &config.trading_end)?,
        };
        session.validate()?;
        Ok(session)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.market_open >= self.market_close {
            return Err(ValidationError::Session(format!(
                "market_open {} must be before market_close {}",
                self.market_open, self.market_close
            )));
        }
        if self.trading_start > self.trading_end {
            return Err(ValidationError::Session(format!(
                "trading_start {} is after trading_end {}",
                self.trading_start, self.trading_end
            )));
        }
        if self.trading_start < self.market_open || self.trading_end > self.market_close {
            return Err(ValidationError::Session(
                "trading window must lie within market hours".to_string(),
            ));
        }
        Ok(())
    }

    /// Inclusive on both ends
    pub fn in_market_hours(&self, time: NaiveTime) -> bool {
        time >= self.market_open && time <= self.market_close
    }

    /// Inclusive on both ends
    pub fn in_trading_window(&self, time: NaiveTime) -> bool {
        time >= self.trading_start && time <= self.trading_end
    }

    pub fn after_close(&self, time: NaiveTime) -> bool {
        time > self.market_close
    }

    pub fn gate(&self, time: NaiveTime) -> GateDecision {
        if !self.in_market_hours(time) {
            GateDecision::Defer
        } else if !self.in_trading_window(time) {
            GateDecision::Drop
        } else {
            GateDecision::Submit
        }
    }

    /// Minutes the market is open per day
    pub fn market_minutes(&self) -> i64 {
        (self.market_close - self.market_open).num_minutes()
    }
}
