use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::api::OrderSink;
use crate::error::SinkError;
use crate::models::{OrderConfirmation, OrderIntent};

/// Routing flags threaded through every gate transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionMode {
    /// Log the intent instead of submitting it
    pub dry_run: bool,
    /// Submit to the exchange test environment
    pub sandbox: bool,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self {
            dry_run: true,
            sandbox: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Idle,
    Armed,
    Submitted,
}

/// Per-symbol dedup record
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub phase: GatePhase,
    pub last_acted: Option<DateTime<Utc>>,
}

impl Default for ExecutionRecord {
    fn default() -> Self {
        Self {
            phase: GatePhase::Idle,
            last_acted: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Already acted on this candle (or a later one)
    Duplicate { last_acted: DateTime<Utc> },
    /// A previous submission for this symbol never settled
    InFlight,
    /// Logged only; the candle counts as acted on
    DryRun,
    Submitted(OrderConfirmation),
    /// Retryable failure; the candle stays open for another attempt
    Retryable(SinkError),
    /// Exchange refused the order; not resubmitted without a new signal
    Rejected(SinkError),
}

impl GateOutcome {
    /// Whether the candle is now recorded as acted on
    pub fn is_settled(&self) -> bool {
        matches!(self, GateOutcome::DryRun | GateOutcome::Submitted(_))
    }
}

/// Acts at most once per closed candle per symbol
///
/// Idle -> Armed on an intent newer than `last_acted`; Armed -> Idle directly
/// in dry-run, or Armed -> Submitted -> Idle around the order sink call.
/// `last_acted` only moves on a dry-run or a successful submission.
pub struct ExecutionGate {
    mode: ExecutionMode,
    submit_timeout: Option<Duration>,
    records: HashMap<String, ExecutionRecord>,
}

impl ExecutionGate {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            submit_timeout: None,
            records: HashMap::new(),
        }
    }

    /// Treat submissions slower than `limit` as transient failures
    pub fn with_submit_timeout(mut self, limit: Duration) -> Self {
        self.submit_timeout = Some(limit);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn record(&self, symbol: &str) -> Option<&ExecutionRecord> {
        self.records.get(symbol)
    }

    pub fn last_acted(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.records.get(symbol).and_then(|r| r.last_acted)
    }

    pub fn phase(&self, symbol: &str) -> GatePhase {
        self.records
            .get(symbol)
            .map(|r| r.phase)
            .unwrap_or(GatePhase::Idle)
    }

    /// Run one intent through the state machine
    pub async fn execute(&mut self, intent: &OrderIntent, sink: &dyn OrderSink) -> GateOutcome {
        if let Err(outcome) = self.arm(intent) {
            return outcome;
        }

        if self.mode.dry_run {
            tracing::info!(
                symbol = %intent.symbol,
                side = %intent.side,
                quantity = %intent.quantity,
                price = %intent.reference_price,
                candle = %intent.reference_candle_time,
                sandbox = self.mode.sandbox,
                "[DRY-RUN] Order suppressed"
            );
            self.settle(&intent.symbol, Some(intent.reference_candle_time));
            return GateOutcome::DryRun;
        }

        self.set_phase(&intent.symbol, GatePhase::Submitted);
        let submission = sink.submit(intent, self.mode.sandbox);
        let result = match self.submit_timeout {
            Some(limit) => tokio::time::timeout(limit, submission)
                .await
                .unwrap_or_else(|_| {
                    Err(SinkError::Transient(format!(
                        "order submission timed out after {:?}",
                        limit
                    )))
                }),
            None => submission.await,
        };

        match result {
            Ok(confirmation) => {
                tracing::info!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    order_id = %confirmation.order_id,
                    status = %confirmation.status,
                    sandbox = self.mode.sandbox,
                    "Order accepted"
                );
                self.settle(&intent.symbol, Some(intent.reference_candle_time));
                GateOutcome::Submitted(confirmation)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    symbol = %intent.symbol,
                    error = %err,
                    "Order submission failed, will retry on next poll"
                );
                self.settle(&intent.symbol, None);
                GateOutcome::Retryable(err)
            }
            Err(err) => {
                tracing::error!(
                    symbol = %intent.symbol,
                    error = %err,
                    "Order rejected by exchange"
                );
                self.settle(&intent.symbol, None);
                GateOutcome::Rejected(err)
            }
        }
    }

    /// Idle -> Armed, or the reason the intent is refused
    fn arm(&mut self, intent: &OrderIntent) -> Result<(), GateOutcome> {
        let record = self.records.entry(intent.symbol.clone()).or_default();

        if record.phase != GatePhase::Idle {
            tracing::warn!(
                symbol = %intent.symbol,
                phase = ?record.phase,
                "Previous action never settled, refusing new intent"
            );
            return Err(GateOutcome::InFlight);
        }

        if let Some(last_acted) = record.last_acted {
            if intent.reference_candle_time <= last_acted {
                tracing::debug!(
                    symbol = %intent.symbol,
                    candle = %intent.reference_candle_time,
                    last_acted = %last_acted,
                    "Already acted on this candle"
                );
                return Err(GateOutcome::Duplicate { last_acted });
            }
        }

        record.phase = GatePhase::Armed;
        Ok(())
    }

    fn set_phase(&mut self, symbol: &str, phase: GatePhase) {
        if let Some(record) = self.records.get_mut(symbol) {
            record.phase = phase;
        }
    }

    /// Back to Idle, recording the candle when the action took effect
    fn settle(&mut self, symbol: &str, acted: Option<DateTime<Utc>>) {
        if let Some(record) = self.records.get_mut(symbol) {
            record.phase = GatePhase::Idle;
            if let Some(candle_time) = acted {
                record.last_acted = Some(candle_time);
            }
        }
    }
}
