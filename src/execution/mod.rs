//! Order execution: session gating, position sizing, submission with retry,
//! position bookkeeping and the fill journal.

mod config;
mod engine;
mod journal;
mod order;
mod position;

pub use config::{local_to_utc, ExecutionContext, ExecutionMode, GateDecision, SessionWindow};
pub use engine::{ExecutionEngine, ExecutionEvent, ExecutionOutcome};
pub use journal::{FillJournal, FillRecord};
pub use order::{OrderAck, OrderRequest, OrderSide, OrderType, Validity};
pub use position::PositionBook;
