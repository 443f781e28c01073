use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::{ConfigError, SignalError};
use crate::indicators::RollingSma;
use crate::models::{Candle, Signal};

/// Which side of the slow average the fast average sits on
///
/// A zero delta never flips the trend: it counts as `Below` when no trend
/// has been seen yet and keeps the previous trend otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Above,
    Below,
}

/// Rolling state for one symbol
#[derive(Debug, Clone)]
pub struct MovingAverageState {
    fast: RollingSma,
    slow: RollingSma,
    last_open_time: Option<DateTime<Utc>>,
    prev_delta: Option<Decimal>,
    trend: Option<Trend>,
}

impl MovingAverageState {
    fn new(fast_window: usize, slow_window: usize) -> Self {
        Self {
            fast: RollingSma::new(fast_window),
            slow: RollingSma::new(slow_window),
            last_open_time: None,
            prev_delta: None,
            trend: None,
        }
    }

    /// Current (fast, slow) averages once the slow window is full
    pub fn averages(&self) -> Option<(Decimal, Decimal)> {
        if !self.slow.is_full() {
            return None;
        }
        Some((self.fast.mean()?, self.slow.mean()?))
    }

    pub fn last_open_time(&self) -> Option<DateTime<Utc>> {
        self.last_open_time
    }

    /// fast - slow as of the last accepted candle
    pub fn prev_delta(&self) -> Option<Decimal> {
        self.prev_delta
    }

    pub fn trend(&self) -> Option<Trend> {
        self.trend
    }
}

/// Dual simple-moving-average crossover detector
///
/// Keeps one `MovingAverageState` per symbol. Every accepted candle updates
/// the state before the signal is returned, so feeding the same candle twice
/// is rejected with `SignalError::StaleCandle` instead of being counted again.
#[derive(Debug, Clone)]
pub struct SignalEngine {
    fast_window: usize,
    slow_window: usize,
    states: HashMap<String, MovingAverageState>,
}

impl SignalEngine {
    /// Create an engine with validated window sizes (1 <= fast < slow)
    pub fn new(fast_window: usize, slow_window: usize) -> Result<Self, ConfigError> {
        if fast_window == 0 {
            return Err(ConfigError::Invalid(
                "fast_window must be at least 1".to_string(),
            ));
        }
        if fast_window >= slow_window {
            return Err(ConfigError::Invalid(format!(
                "fast_window ({}) must be smaller than slow_window ({})",
                fast_window, slow_window
            )));
        }

        Ok(Self {
            fast_window,
            slow_window,
            states: HashMap::new(),
        })
    }

    pub fn fast_window(&self) -> usize {
        self.fast_window
    }

    pub fn slow_window(&self) -> usize {
        self.slow_window
    }

    /// Feed one closed candle and get the crossover signal it produces
    pub fn on_closed_candle(
        &mut self,
        symbol: &str,
        candle: &Candle,
    ) -> Result<Signal, SignalError> {
        let (fast_window, slow_window) = (self.fast_window, self.slow_window);
        let state = self
            .states
            .entry(symbol.to_string())
            .or_insert_with(|| MovingAverageState::new(fast_window, slow_window));

        if let Some(last_seen) = state.last_open_time {
            if candle.open_time <= last_seen {
                return Err(SignalError::StaleCandle {
                    symbol: symbol.to_string(),
                    open_time: candle.open_time,
                    last_seen,
                });
            }
        }

        state.last_open_time = Some(candle.open_time);
        state.fast.push(candle.close);
        state.slow.push(candle.close);

        let Some((fast_avg, slow_avg)) = state.averages() else {
            tracing::debug!(
                symbol = %symbol,
                samples = state.slow.len(),
                needed = slow_window,
                "Collecting history"
            );
            return Ok(Signal::None);
        };

        let delta = fast_avg - slow_avg;
        let next_trend = if delta > Decimal::ZERO {
            Trend::Above
        } else if delta < Decimal::ZERO {
            Trend::Below
        } else {
            state.trend.unwrap_or(Trend::Below)
        };

        let signal = match (state.trend, next_trend) {
            (Some(Trend::Below), Trend::Above) => Signal::GoldenCross,
            (Some(Trend::Above), Trend::Below) => Signal::DeathCross,
            _ => Signal::None,
        };

        state.prev_delta = Some(delta);
        state.trend = Some(next_trend);

        tracing::debug!(
            symbol = %symbol,
            fast = %fast_avg,
            slow = %slow_avg,
            delta = %delta,
            signal = %signal,
            "Moving averages updated"
        );

        Ok(signal)
    }

    /// Open time of the last accepted candle for a symbol
    pub fn last_open_time(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.states.get(symbol).and_then(|s| s.last_open_time)
    }

    pub fn state(&self, symbol: &str) -> Option<&MovingAverageState> {
        self.states.get(symbol)
    }

    /// (fast, slow) for a symbol once its slow window is full
    pub fn averages(&self, symbol: &str) -> Option<(Decimal, Decimal)> {
        self.states.get(symbol).and_then(|s| s.averages())
    }

    /// Drop all state for a symbol (e.g. removed from configuration)
    pub fn remove_symbol(&mut self, symbol: &str) -> bool {
        self.states.remove(symbol).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn candle_at(index: i64, close: Decimal) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::hours(index),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    fn feed(engine: &mut SignalEngine, symbol: &str, closes: &[Decimal]) -> Vec<Signal> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                engine
                    .on_closed_candle(symbol, &candle_at(i as i64, *close))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_rejects_invalid_windows() {
        assert!(SignalEngine::new(0, 3).is_err());
        assert!(SignalEngine::new(3, 3).is_err());
        assert!(SignalEngine::new(5, 3).is_err());
        assert!(SignalEngine::new(1, 2).is_ok());
    }

    #[test]
    fn test_no_signal_until_slow_window_full() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        let signals = feed(&mut engine, "BTC/USDT", &[dec!(10), dec!(1)]);

        assert_eq!(signals, vec![Signal::None, Signal::None]);
        assert!(engine.state("BTC/USDT").unwrap().averages().is_none());
    }

    #[test]
    fn test_first_full_window_only_seeds_trend() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        let signals = feed(&mut engine, "BTC/USDT", &[dec!(1), dec!(2), dec!(3)]);

        // fast 2.5 > slow 2, but there is no previous delta to cross from
        assert_eq!(signals[2], Signal::None);
        assert_eq!(engine.state("BTC/USDT").unwrap().trend(), Some(Trend::Above));
    }

    #[test]
    fn test_golden_then_death_cross() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        let signals = feed(
            &mut engine,
            "BTC/USDT",
            &[dec!(3), dec!(2), dec!(1), dec!(4), dec!(5), dec!(1), dec!(0)],
        );

        // deltas: -, +, +, -, -
        assert_eq!(
            signals,
            vec![
                Signal::None,
                Signal::None,
                Signal::None,
                Signal::GoldenCross,
                Signal::None,
                Signal::DeathCross,
                Signal::None,
            ]
        );
    }

    #[test]
    fn test_signals_alternate() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        let closes: Vec<Decimal> = [1, 2, 3, 4, 5, 6, 1, 2]
            .iter()
            .map(|c| Decimal::from(*c))
            .collect();
        let signals = feed(&mut engine, "BTC/USDT", &closes);

        let crosses: Vec<Signal> = signals
            .into_iter()
            .filter(|s| *s != Signal::None)
            .collect();
        for pair in crosses.windows(2) {
            assert_ne!(pair[0], pair[1], "crossovers must alternate");
        }
    }

    #[test]
    fn test_flat_market_never_signals() {
        let mut engine = SignalEngine::new(2, 4).unwrap();
        let signals = feed(&mut engine, "BTC/USDT", &[dec!(10); 12]);

        assert!(signals.iter().all(|s| *s == Signal::None));
        assert_eq!(engine.state("BTC/USDT").unwrap().prev_delta(), Some(dec!(0)));
        assert_eq!(engine.state("BTC/USDT").unwrap().trend(), Some(Trend::Below));
    }

    #[test]
    fn test_zero_delta_does_not_repeat_cross() {
        let mut engine = SignalEngine::new(1, 2).unwrap();
        // deltas: -1 (seed), +1 golden, 0 (flat), +1 must not cross again
        let signals = feed(
            &mut engine,
            "BTC/USDT",
            &[dec!(2), dec!(1), dec!(2), dec!(2), dec!(3)],
        );

        assert_eq!(
            signals,
            vec![
                Signal::None,
                Signal::None,
                Signal::GoldenCross,
                Signal::None,
                Signal::None,
            ]
        );
    }

    #[test]
    fn test_zero_seed_counts_as_below() {
        let mut engine = SignalEngine::new(1, 2).unwrap();
        // deltas: 0 (seed, below), +1 golden
        let signals = feed(&mut engine, "BTC/USDT", &[dec!(5), dec!(5), dec!(7)]);

        assert_eq!(signals[2], Signal::GoldenCross);
    }

    #[test]
    fn test_duplicate_candle_rejected_without_mutation() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        feed(&mut engine, "BTC/USDT", &[dec!(1), dec!(2), dec!(3)]);
        let before = engine.state("BTC/USDT").unwrap().averages();

        let replay = candle_at(2, dec!(100));
        let result = engine.on_closed_candle("BTC/USDT", &replay);

        assert!(matches!(result, Err(SignalError::StaleCandle { .. })));
        assert_eq!(engine.state("BTC/USDT").unwrap().averages(), before);
    }

    #[test]
    fn test_older_candle_rejected() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        engine
            .on_closed_candle("BTC/USDT", &candle_at(5, dec!(1)))
            .unwrap();

        let result = engine.on_closed_candle("BTC/USDT", &candle_at(4, dec!(1)));
        assert!(matches!(result, Err(SignalError::StaleCandle { .. })));
        assert_eq!(
            engine.last_open_time("BTC/USDT"),
            Some(candle_at(5, dec!(1)).open_time)
        );
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut engine = SignalEngine::new(2, 3).unwrap();
        engine
            .on_closed_candle("BTC/USDT", &candle_at(3, dec!(1)))
            .unwrap();

        // Same open time on another symbol is fine
        assert!(engine
            .on_closed_candle("ETH/USDT", &candle_at(3, dec!(1)))
            .is_ok());

        assert!(engine.remove_symbol("BTC/USDT"));
        assert!(engine.last_open_time("BTC/USDT").is_none());
        assert!(engine.last_open_time("ETH/USDT").is_some());
    }
}
