//! Bot configuration: defaults, then an optional TOML file, then `CROSSBOT_*` env vars.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::ExecutionMode;
use crate::models::split_symbol;
use crate::risk::RiskLimits;

pub const ENV_PREFIX: &str = "CROSSBOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Trading pair, BASE/QUOTE
    pub symbol: String,
    /// Exchange kline interval, e.g. "1h"
    pub timeframe: String,
    pub fast_window: usize,
    pub slow_window: usize,
    pub risk_fraction: Decimal,
    pub max_notional: Decimal,
    pub min_quote_balance: Decimal,
    pub sell_fraction: Decimal,
    pub dry_run: bool,
    pub sandbox: bool,
    pub poll_interval_seconds: u64,
    /// Closed candles replayed into the signal engine at startup
    pub warmup_candles: Option<usize>,
    pub log_level: String,
    pub request_timeout_seconds: u64,
    /// Quote balance of the paper account used by credential-less dry runs
    pub paper_balance: Decimal,
    pub exchange_base_url: Option<String>,
    pub exchange_sandbox_url: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT".to_string(),
            timeframe: "1h".to_string(),
            fast_window: 20,
            slow_window: 50,
            risk_fraction: Decimal::new(1, 2),
            max_notional: Decimal::from(100),
            min_quote_balance: Decimal::ZERO,
            sell_fraction: Decimal::ONE,
            dry_run: true,
            sandbox: false,
            poll_interval_seconds: 60,
            warmup_candles: None,
            log_level: "info".to_string(),
            request_timeout_seconds: 10,
            paper_balance: Decimal::from(1000),
            exchange_base_url: None,
            exchange_sandbox_url: None,
        }
    }
}

impl BotConfig {
    /// Load and validate
    ///
    /// A missing file is not an error; every option has a default except
    /// that the result must still pass validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&BotConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: BotConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if split_symbol(&self.symbol).is_none() {
            return Err(ConfigError::Invalid(format!(
                "symbol must look like BASE/QUOTE, got '{}'",
                self.symbol
            )));
        }
        if self.timeframe.trim().is_empty() {
            return Err(ConfigError::Invalid("timeframe must not be empty".to_string()));
        }
        if self.fast_window == 0 || self.fast_window >= self.slow_window {
            return Err(ConfigError::Invalid(format!(
                "windows must satisfy 1 <= fast_window < slow_window, got {} / {}",
                self.fast_window, self.slow_window
            )));
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_seconds must be positive".to_string(),
            ));
        }
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.paper_balance < Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "paper_balance must not be negative".to_string(),
            ));
        }
        self.risk_limits().validate()
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            risk_fraction: self.risk_fraction,
            max_notional: self.max_notional,
            min_quote_balance: self.min_quote_balance,
            sell_fraction: self.sell_fraction,
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode {
            dry_run: self.dry_run,
            sandbox: self.sandbox,
        }
    }

    pub fn warmup_candles(&self) -> usize {
        self.warmup_candles.unwrap_or(self.slow_window + 1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid_and_safe() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.dry_run);
        assert!(!config.sandbox);
        assert_eq!(config.warmup_candles(), 51);
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let config = BotConfig {
            fast_window: 50,
            slow_window: 20,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_risk_fraction() {
        let config = BotConfig {
            risk_fraction: dec!(1.2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_symbol_without_quote() {
        let config = BotConfig {
            symbol: "BTCUSDT".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "crossbot-config-test-{}.toml",
            std::process::id()
        ));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(
                file,
                r#"
symbol = "ETH/USDT"
timeframe = "15m"
fast_window = 3
slow_window = 5
risk_fraction = "0.25"
max_notional = "250.5"
dry_run = false
sandbox = true
poll_interval_seconds = 30
"#
            )
            .unwrap();
        }

        let config = BotConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.symbol, "ETH/USDT");
        assert_eq!(config.timeframe, "15m");
        assert_eq!(config.fast_window, 3);
        assert_eq!(config.slow_window, 5);
        assert_eq!(config.risk_fraction, dec!(0.25));
        assert_eq!(config.max_notional, dec!(250.5));
        assert_eq!(config.execution_mode(), ExecutionMode { dry_run: false, sandbox: true });
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        // untouched options keep their defaults
        assert_eq!(config.sell_fraction, dec!(1));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "crossbot-config-invalid-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "fast_window = 9\nslow_window = 4\n").unwrap();

        let result = BotConfig::load(Some(&path));
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
