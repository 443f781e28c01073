//! Exchange collaborators: traits the bot loop consumes plus their implementations.

pub mod binance;
pub mod paper;

use async_trait::async_trait;

use crate::error::{SinkError, SourceError};
use crate::models::{AccountState, Candle, MarketRules, OrderConfirmation, OrderIntent};

pub use binance::{BinanceClient, BinanceCredentials};
pub use paper::PaperAccount;

/// Supplies closed OHLCV candles and lot-size rules
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Most recent candle whose interval has fully elapsed
    async fn fetch_latest_closed_candle(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Candle, SourceError>;

    /// Up to `limit` closed candles, oldest first
    async fn fetch_closed_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError>;

    async fn fetch_market_rules(&self, symbol: &str) -> Result<MarketRules, SourceError>;
}

/// Supplies balances for sizing decisions
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_account_state(&self, symbol: &str) -> Result<AccountState, SourceError>;

    /// Called after a dry-run decision; real accounts ignore it
    async fn record_simulated_fill(&self, _intent: &OrderIntent) {}
}

/// Exchange order submission
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn submit(
        &self,
        intent: &OrderIntent,
        sandbox: bool,
    ) -> Result<OrderConfirmation, SinkError>;
}
