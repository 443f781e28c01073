use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

use crate::models::{Side, Signal};

/// What a decision cycle ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum CycleAction {
    NoOp(String),
    DryRun {
        side: Side,
        quantity: Decimal,
    },
    Submitted {
        side: Side,
        quantity: Decimal,
        order_id: String,
    },
    Retrying {
        side: Side,
        quantity: Decimal,
        error: String,
    },
    Rejected {
        side: Side,
        quantity: Decimal,
        error: String,
    },
}

/// One diagnostics line per symbol per cycle
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionReport {
    pub symbol: String,
    pub candle_time: Option<DateTime<Utc>>,
    /// None when no new candle was evaluated this cycle
    pub signal: Option<Signal>,
    pub action: CycleAction,
}

impl DecisionReport {
    pub fn no_op(
        symbol: &str,
        candle_time: Option<DateTime<Utc>>,
        signal: Option<Signal>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            candle_time,
            signal,
            action: CycleAction::NoOp(reason.into()),
        }
    }

    /// True when an order was decided but dry-run kept it from the exchange
    pub fn dry_run_suppressed(&self) -> bool {
        matches!(self.action, CycleAction::DryRun { .. })
    }

    pub fn side(&self) -> Option<Side> {
        match &self.action {
            CycleAction::NoOp(_) => None,
            CycleAction::DryRun { side, .. }
            | CycleAction::Submitted { side, .. }
            | CycleAction::Retrying { side, .. }
            | CycleAction::Rejected { side, .. } => Some(*side),
        }
    }
}

impl fmt::Display for CycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleAction::NoOp(reason) => write!(f, "no-op ({})", reason),
            CycleAction::DryRun { side, quantity } => {
                write!(f, "{} {} (dry-run, not submitted)", side, quantity)
            }
            CycleAction::Submitted {
                side,
                quantity,
                order_id,
            } => write!(f, "{} {} submitted as order {}", side, quantity, order_id),
            CycleAction::Retrying {
                side,
                quantity,
                error,
            } => write!(f, "{} {} failed, retrying next poll: {}", side, quantity, error),
            CycleAction::Rejected {
                side,
                quantity,
                error,
            } => write!(f, "{} {} rejected: {}", side, quantity, error),
        }
    }
}

impl fmt::Display for DecisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let candle = self
            .candle_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let signal = self
            .signal
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());

        write!(
            f,
            "symbol={} candle={} signal={} action={} dry_run_suppressed={}",
            self.symbol,
            candle,
            signal,
            self.action,
            self.dry_run_suppressed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dry_run_line() {
        let report = DecisionReport {
            symbol: "BTC/USDT".to_string(),
            candle_time: None,
            signal: Some(Signal::GoldenCross),
            action: CycleAction::DryRun {
                side: Side::Buy,
                quantity: dec!(0.5),
            },
        };

        let line = report.to_string();
        assert!(line.contains("symbol=BTC/USDT"));
        assert!(line.contains("signal=golden-cross"));
        assert!(line.contains("BUY 0.5"));
        assert!(line.ends_with("dry_run_suppressed=true"));
        assert_eq!(report.side(), Some(Side::Buy));
    }

    #[test]
    fn test_no_op_line() {
        let report = DecisionReport::no_op("ETH/USDT", None, None, "awaiting next closed candle");

        assert_eq!(
            report.to_string(),
            "symbol=ETH/USDT candle=- signal=- action=no-op (awaiting next closed candle) dry_run_suppressed=false"
        );
        assert!(report.side().is_none());
    }
}
