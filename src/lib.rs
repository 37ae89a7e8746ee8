// Library crate - exports shared types and trading logic

pub mod broker;
pub mod config;
pub mod execution;
pub mod persistence;
pub mod scheduler;
pub mod streams;
pub mod trading_core;
pub mod types;

// Re-export commonly used types
pub use config::{InstanceConfig, TraderConfig, ValidationError};
pub use types::*;
