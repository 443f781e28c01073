use chrono::{DateTime, Utc};
use thiserror::Error;

/// Signal engine contract violations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalError {
    #[error("stale candle for {symbol}: open time {open_time} is not after {last_seen}")]
    StaleCandle {
        symbol: String,
        open_time: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
}

/// Failures of the candle and account collaborators
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Network, rate limit or timeout; retry on the next poll
    #[error("transient source error: {0}")]
    Transient(String),

    /// The collaborator answered but the answer is unusable
    #[error("invalid source response: {0}")]
    Invalid(String),
}

/// Failures of order submission
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    /// Network, rate limit or timeout; the order may be retried
    #[error("transient order error: {0}")]
    Transient(String),

    /// The exchange refused the order (balance, size, filters)
    #[error("order rejected ({code:?}): {reason}")]
    Rejected { code: Option<i64>, reason: String },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Startup configuration problems; always fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_classification() {
        assert!(SinkError::Transient("timeout".to_string()).is_retryable());
        assert!(!SinkError::Rejected {
            code: Some(-2010),
            reason: "insufficient balance".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_rejected_display() {
        let err = SinkError::Rejected {
            code: Some(-1013),
            reason: "Filter failure: LOT_SIZE".to_string(),
        };
        assert!(err.to_string().contains("LOT_SIZE"));
    }
}
