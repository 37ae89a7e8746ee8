//! Live tick distribution
//!
//! Adapter (one per venue connection) -> Handler (per-instrument fan-out)
//! -> Consumers.

mod adapter;
mod consumer;
mod handler;
mod live;

pub use adapter::{LoopbackAdapter, MarketDataAdapter, SubscriptionTable};
pub use consumer::{ConsumerRef, TickConsumer};
pub use handler::TickHandler;
pub use live::WsMarketDataAdapter;
