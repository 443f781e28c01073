// Core modules
pub mod api;
pub mod bot;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use bot::{BotLoop, CycleAction, DecisionReport};
pub use config::BotConfig;
pub use error::{ConfigError, SignalError, SinkError, SourceError};
pub use models::*;
