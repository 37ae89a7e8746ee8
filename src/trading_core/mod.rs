//! Trading Core - strategy logic and the per-instance orchestrator
//!
//! - Volatility-band trend engine
//! - Strategy trait and the built-in strategies
//! - Weekly high breakout on live ticks
//! - Trader: scheduling, fetching, gating and execution for one instance

pub mod breakout;
pub mod strategy;
pub mod trader;
pub mod trend;

// Re-export commonly used types
pub use breakout::{BreakoutPosition, WeeklyBreakoutParams, WeeklyBreakoutStrategy};
pub use strategy::{build_strategy, Strategy, TrendFlipParams, TrendFlipStrategy};
pub use trader::{closed_candles, CycleOutcome, Trader, TraderServices, TraderState};
pub use trend::{TrendConfig, TrendDirection, TrendEngine, TrendPoint, TrendState, TrendTrace, VolatilityMode};
