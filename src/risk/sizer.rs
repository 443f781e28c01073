use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::models::{AccountState, Candle, MarketRules, OrderIntent, Side, Signal};

/// Limits bounding every order the sizer produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Fraction of the free quote balance committed per entry (0 < x <= 1)
    pub risk_fraction: Decimal,
    /// Hard cap on the notional of one entry, in quote currency
    pub max_notional: Decimal,
    /// Skip entries while the free quote balance is below this
    pub min_quote_balance: Decimal,
    /// Fraction of the held position sold on exit (0 < x <= 1)
    pub sell_fraction: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            risk_fraction: Decimal::new(1, 2), // 1% of free balance
            max_notional: Decimal::from(100),  // 100 quote per trade
            min_quote_balance: Decimal::ZERO,
            sell_fraction: Decimal::ONE, // close the whole long
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk_fraction <= Decimal::ZERO || self.risk_fraction > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "risk_fraction must be in (0, 1], got {}",
                self.risk_fraction
            )));
        }
        if self.sell_fraction <= Decimal::ZERO || self.sell_fraction > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "sell_fraction must be in (0, 1], got {}",
                self.sell_fraction
            )));
        }
        if self.max_notional <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "max_notional must be positive, got {}",
                self.max_notional
            )));
        }
        if self.min_quote_balance < Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "min_quote_balance must not be negative, got {}",
                self.min_quote_balance
            )));
        }
        Ok(())
    }
}

/// Why no order was produced
#[derive(Debug, Clone, PartialEq)]
pub enum NoActionReason {
    NoSignal,
    AlreadyLong,
    NoPosition,
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },
    BelowMinimumSize {
        quantity: Decimal,
        minimum: Decimal,
    },
}

impl fmt::Display for NoActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoActionReason::NoSignal => write!(f, "no signal"),
            NoActionReason::AlreadyLong => write!(f, "golden cross while already long"),
            NoActionReason::NoPosition => write!(f, "death cross while flat"),
            NoActionReason::InsufficientBalance {
                available,
                required,
            } => write!(
                f,
                "insufficient quote balance ({} < {})",
                available, required
            ),
            NoActionReason::BelowMinimumSize { quantity, minimum } => {
                write!(f, "below minimum size ({} < {})", quantity, minimum)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizingDecision {
    Order(OrderIntent),
    NoAction(NoActionReason),
}

impl SizingDecision {
    pub fn intent(self) -> Option<OrderIntent> {
        match self {
            SizingDecision::Order(intent) => Some(intent),
            SizingDecision::NoAction(_) => None,
        }
    }
}

/// Turns crossover signals into long-only, risk-bounded order intents
#[derive(Debug, Clone)]
pub struct RiskSizer {
    limits: RiskLimits,
}

impl RiskSizer {
    pub fn new(limits: RiskLimits) -> Result<Self, ConfigError> {
        limits.validate()?;
        Ok(Self { limits })
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Decide whether and how much to trade on this candle
    pub fn size(
        &self,
        symbol: &str,
        signal: Signal,
        candle: &Candle,
        account: &AccountState,
        rules: &MarketRules,
    ) -> SizingDecision {
        let is_long = account.position_quantity > Decimal::ZERO
            && account.position_quantity >= rules.min_order_size;

        match signal {
            Signal::None => SizingDecision::NoAction(NoActionReason::NoSignal),
            Signal::GoldenCross if is_long => {
                SizingDecision::NoAction(NoActionReason::AlreadyLong)
            }
            Signal::DeathCross if !is_long => SizingDecision::NoAction(NoActionReason::NoPosition),
            Signal::GoldenCross => self.size_entry(symbol, candle, account, rules),
            Signal::DeathCross => self.size_exit(symbol, candle, account, rules),
        }
    }

    fn size_entry(
        &self,
        symbol: &str,
        candle: &Candle,
        account: &AccountState,
        rules: &MarketRules,
    ) -> SizingDecision {
        if account.available_balance <= Decimal::ZERO
            || account.available_balance < self.limits.min_quote_balance
        {
            return SizingDecision::NoAction(NoActionReason::InsufficientBalance {
                available: account.available_balance,
                required: self.limits.min_quote_balance,
            });
        }
        if candle.close <= Decimal::ZERO {
            return SizingDecision::NoAction(NoActionReason::BelowMinimumSize {
                quantity: Decimal::ZERO,
                minimum: rules.min_order_size,
            });
        }

        let budget = self.entry_budget(account);
        let quantity = rules.floor_to_step(budget / candle.close);

        self.checked_intent(symbol, Side::Buy, quantity, candle, rules)
    }

    fn size_exit(
        &self,
        symbol: &str,
        candle: &Candle,
        account: &AccountState,
        rules: &MarketRules,
    ) -> SizingDecision {
        let quantity = rules.floor_to_step(account.position_quantity * self.limits.sell_fraction);
        self.checked_intent(symbol, Side::Sell, quantity, candle, rules)
    }

    /// min(max_notional, available_balance * risk_fraction)
    pub fn entry_budget(&self, account: &AccountState) -> Decimal {
        (account.available_balance * self.limits.risk_fraction).min(self.limits.max_notional)
    }

    fn checked_intent(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        candle: &Candle,
        rules: &MarketRules,
    ) -> SizingDecision {
        if quantity <= Decimal::ZERO || quantity < rules.min_order_size {
            tracing::info!(
                symbol = %symbol,
                side = %side,
                quantity = %quantity,
                minimum = %rules.min_order_size,
                "Sized quantity below exchange minimum, skipping"
            );
            return SizingDecision::NoAction(NoActionReason::BelowMinimumSize {
                quantity,
                minimum: rules.min_order_size,
            });
        }

        SizingDecision::Order(OrderIntent {
            symbol: symbol.to_string(),
            side,
            quantity,
            reference_candle_time: candle.open_time,
            reference_price: candle.close,
        })
    }
}
