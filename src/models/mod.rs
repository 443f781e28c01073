use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV candlestick data for one closed interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Crossover signal emitted per closed candle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    None,
    GoldenCross,
    DeathCross,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::None => write!(f, "none"),
            Signal::GoldenCross => write!(f, "golden-cross"),
            Signal::DeathCross => write!(f, "death-cross"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Exchange wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the risk sizer wants the gate to execute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Open time of the candle whose close triggered the intent
    pub reference_candle_time: DateTime<Utc>,
    /// Close of that candle
    pub reference_price: Decimal,
}

/// Exchange acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub executed_quantity: Decimal,
    pub status: String,
}

/// Free balances relevant to one trading pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountState {
    /// Free quote currency (e.g. USDT)
    pub available_balance: Decimal,
    /// Free base currency (e.g. BTC)
    pub position_quantity: Decimal,
}

/// Lot-size rules of the exchange for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MarketRules {
    pub min_order_size: Decimal,
    pub step_size: Decimal,
}

impl MarketRules {
    /// Floor a quantity down to a whole number of steps
    pub fn floor_to_step(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.step_size).floor() * self.step_size
    }
}

/// Split "BTC/USDT" into ("BTC", "USDT")
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

/// Length of an exchange kline interval ("15m", "1h", "1d", ...)
///
/// None for calendar intervals such as "1M" and for anything unparseable.
pub fn timeframe_duration(timeframe: &str) -> Option<chrono::Duration> {
    let unit = timeframe.chars().last()?;
    let count: i64 = timeframe[..timeframe.len() - unit.len_utf8()].parse().ok()?;
    if count <= 0 {
        return None;
    }
    match unit {
        's' => Some(chrono::Duration::seconds(count)),
        'm' => Some(chrono::Duration::minutes(count)),
        'h' => Some(chrono::Duration::hours(count)),
        'd' => Some(chrono::Duration::days(count)),
        'w' => Some(chrono::Duration::weeks(count)),
        _ => None,
    }
}
