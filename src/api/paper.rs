use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::AccountSource;
use crate::error::SourceError;
use crate::models::{AccountState, OrderIntent, Side};

/// In-memory account for dry-run sessions
///
/// Dry-run decisions are applied at the triggering candle's close, so a
/// simulated long can later be closed by a death cross.
pub struct PaperAccount {
    state: Mutex<AccountState>,
}

impl PaperAccount {
    pub fn new(quote_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(AccountState {
                available_balance: quote_balance,
                position_quantity: Decimal::ZERO,
            }),
        }
    }

    pub async fn snapshot(&self) -> AccountState {
        *self.state.lock().await
    }
}

#[async_trait]
impl AccountSource for PaperAccount {
    async fn fetch_account_state(&self, _symbol: &str) -> Result<AccountState, SourceError> {
        Ok(*self.state.lock().await)
    }

    async fn record_simulated_fill(&self, intent: &OrderIntent) {
        let mut state = self.state.lock().await;
        let notional = intent.quantity * intent.reference_price;

        match intent.side {
            Side::Buy => {
                state.available_balance -= notional;
                state.position_quantity += intent.quantity;
            }
            Side::Sell => {
                let quantity = intent.quantity.min(state.position_quantity);
                state.position_quantity -= quantity;
                state.available_balance += quantity * intent.reference_price;
            }
        }

        tracing::info!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            price = %intent.reference_price,
            balance = %state.available_balance,
            position = %state.position_quantity,
            "Paper fill applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn intent(side: Side, quantity: Decimal, price: Decimal) -> OrderIntent {
        OrderIntent {
            symbol: "BTC/USDT".to_string(),
            side,
            quantity,
            reference_candle_time: Utc::now(),
            reference_price: price,
        }
    }

    #[tokio::test]
    async fn test_starts_flat() {
        let account = PaperAccount::new(dec!(1000));
        let state = account.fetch_account_state("BTC/USDT").await.unwrap();

        assert_eq!(state.available_balance, dec!(1000));
        assert_eq!(state.position_quantity, dec!(0));
    }

    #[tokio::test]
    async fn test_round_trip_fills() {
        let account = PaperAccount::new(dec!(1000));

        account
            .record_simulated_fill(&intent(Side::Buy, dec!(2), dec!(100)))
            .await;
        let state = account.snapshot().await;
        assert_eq!(state.available_balance, dec!(800));
        assert_eq!(state.position_quantity, dec!(2));

        account
            .record_simulated_fill(&intent(Side::Sell, dec!(2), dec!(110)))
            .await;
        let state = account.snapshot().await;
        assert_eq!(state.available_balance, dec!(1020));
        assert_eq!(state.position_quantity, dec!(0));
    }

    #[tokio::test]
    async fn test_sell_capped_at_position() {
        let account = PaperAccount::new(dec!(0));
        account
            .record_simulated_fill(&intent(Side::Sell, dec!(5), dec!(10)))
            .await;

        let state = account.snapshot().await;
        assert_eq!(state.position_quantity, dec!(0));
        assert_eq!(state.available_balance, dec!(0));
    }
}
