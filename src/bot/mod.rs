//! Polling loop that wires candles, signals, sizing and execution together.

pub mod report;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::api::{AccountSource, CandleSource, OrderSink};
use crate::config::BotConfig;
use crate::error::{ConfigError, SourceError};
use crate::execution::{ExecutionGate, GateOutcome};
use crate::models::{timeframe_duration, AccountState, Candle, MarketRules, OrderIntent};
use crate::risk::{RiskSizer, SizingDecision};
use crate::strategy::SignalEngine;

pub use report::{CycleAction, DecisionReport};

/// A rejected order remembered until the next candle closes
#[derive(Debug, Clone)]
struct RejectedNote {
    candle_time: DateTime<Utc>,
    reason: String,
}

pub struct BotLoop {
    symbols: Vec<String>,
    timeframe: String,
    poll_interval: Duration,
    call_timeout: Duration,
    warmup_candles: usize,
    engine: SignalEngine,
    sizer: RiskSizer,
    gate: ExecutionGate,
    candles: Arc<dyn CandleSource>,
    account: Arc<dyn AccountSource>,
    sink: Arc<dyn OrderSink>,
    rules: HashMap<String, MarketRules>,
    /// Intents that failed transiently, retried while their candle is current
    pending: HashMap<String, OrderIntent>,
    rejected: HashMap<String, RejectedNote>,
}

impl BotLoop {
    pub fn new(
        config: &BotConfig,
        candles: Arc<dyn CandleSource>,
        account: Arc<dyn AccountSource>,
        sink: Arc<dyn OrderSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            symbols: vec![config.symbol.clone()],
            timeframe: config.timeframe.clone(),
            poll_interval: config.poll_interval(),
            call_timeout: config.request_timeout(),
            warmup_candles: config.warmup_candles(),
            engine: SignalEngine::new(config.fast_window, config.slow_window)?,
            sizer: RiskSizer::new(config.risk_limits())?,
            gate: ExecutionGate::new(config.execution_mode())
                .with_submit_timeout(config.request_timeout()),
            candles,
            account,
            sink,
            rules: HashMap::new(),
            pending: HashMap::new(),
            rejected: HashMap::new(),
        })
    }

    pub fn engine(&self) -> &SignalEngine {
        &self.engine
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Replay recent closed candles so the averages are ready on the first poll
    ///
    /// Signals produced while warming up are discarded. Returns the number of
    /// candles fed across all symbols.
    pub async fn warm_up(&mut self) -> Result<usize, SourceError> {
        if self.warmup_candles == 0 {
            return Ok(0);
        }

        let mut fed = 0;
        for symbol in self.symbols.clone() {
            let history = self
                .call(
                    "candle history",
                    self.candles
                        .fetch_closed_candles(&symbol, &self.timeframe, self.warmup_candles),
                )
                .await?;

            for candle in &history {
                match self.engine.on_closed_candle(&symbol, candle) {
                    Ok(_) => fed += 1,
                    Err(e) => tracing::debug!(symbol = %symbol, error = %e, "Skipping warm-up candle"),
                }
            }

            let averages = self.engine.averages(&symbol);
            tracing::info!(
                symbol = %symbol,
                candles = history.len(),
                ready = averages.is_some(),
                "Warm-up complete"
            );

            self.market_rules(&symbol).await?;
        }

        Ok(fed)
    }

    /// Poll forever on the configured cadence
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            symbols = ?self.symbols,
            timeframe = %self.timeframe,
            poll_seconds = self.poll_interval.as_secs(),
            dry_run = self.gate.mode().dry_run,
            sandbox = self.gate.mode().sandbox,
            "Decision loop started"
        );

        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// One decision cycle over every symbol
    pub async fn run_once(&mut self) -> Vec<DecisionReport> {
        let mut reports = Vec::with_capacity(self.symbols.len());
        for symbol in self.symbols.clone() {
            let report = self.run_cycle(&symbol).await;
            tracing::info!("{}", report);
            reports.push(report);
        }
        reports
    }

    async fn run_cycle(&mut self, symbol: &str) -> DecisionReport {
        let candle = match self
            .call(
                "latest candle",
                self.candles.fetch_latest_closed_candle(symbol, &self.timeframe),
            )
            .await
        {
            Ok(candle) => candle,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Candle fetch failed, skipping cycle");
                return DecisionReport::no_op(
                    symbol,
                    None,
                    None,
                    format!("candle source unavailable: {}", e),
                );
            }
        };

        let last_seen = self.engine.last_open_time(symbol);
        if last_seen == Some(candle.open_time) {
            return self.revisit_candle(symbol, &candle).await;
        }

        let (account, rules) = match self.account_and_rules(symbol).await {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Account or market rules unavailable");
                return DecisionReport::no_op(
                    symbol,
                    Some(candle.open_time),
                    None,
                    format!("account source unavailable: {}", e),
                );
            }
        };

        if let Some(last_seen) = last_seen.filter(|t| *t < candle.open_time) {
            if let Err(e) = self.backfill(symbol, last_seen, &candle).await {
                tracing::warn!(symbol = %symbol, error = %e, "Backfill of missed candles failed");
                return DecisionReport::no_op(
                    symbol,
                    Some(candle.open_time),
                    None,
                    format!("missed candles unavailable: {}", e),
                );
            }
        }

        let signal = match self.engine.on_closed_candle(symbol, &candle) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Signal engine refused candle");
                return DecisionReport::no_op(symbol, Some(candle.open_time), None, e.to_string());
            }
        };

        // a fresh candle supersedes anything left over from the previous one
        self.pending.remove(symbol);
        self.rejected.remove(symbol);

        let intent = match self.sizer.size(symbol, signal, &candle, &account, &rules) {
            SizingDecision::Order(intent) => intent,
            SizingDecision::NoAction(reason) => {
                return DecisionReport::no_op(
                    symbol,
                    Some(candle.open_time),
                    Some(signal),
                    reason.to_string(),
                );
            }
        };

        let action = self.execute(intent).await;
        DecisionReport {
            symbol: symbol.to_string(),
            candle_time: Some(candle.open_time),
            signal: Some(signal),
            action,
        }
    }

    /// Feed candles that closed between `last_seen` and `latest`
    ///
    /// Their signals are dropped; only the latest candle is acted on. Nothing
    /// is fed when the history cannot be fetched.
    async fn backfill(
        &mut self,
        symbol: &str,
        last_seen: DateTime<Utc>,
        latest: &Candle,
    ) -> Result<usize, SourceError> {
        let max_needed = self.engine.slow_window() + 1;
        let limit = match timeframe_duration(&self.timeframe) {
            Some(interval) => {
                let intervals = (latest.open_time - last_seen).num_seconds() / interval.num_seconds();
                if intervals <= 1 {
                    return Ok(0);
                }
                (intervals as usize + 1).min(max_needed)
            }
            None => max_needed,
        };

        let history = self
            .call(
                "missed candles",
                self.candles.fetch_closed_candles(symbol, &self.timeframe, limit),
            )
            .await?;

        let mut fed = 0;
        for candle in history
            .iter()
            .filter(|c| c.open_time > last_seen && c.open_time < latest.open_time)
        {
            if let Ok(signal) = self.engine.on_closed_candle(symbol, candle) {
                tracing::debug!(
                    symbol = %symbol,
                    candle = %candle.open_time,
                    signal = %signal,
                    "Backfilled missed candle"
                );
                fed += 1;
            }
        }

        if fed > 0 {
            tracing::info!(symbol = %symbol, candles = fed, "Caught up on missed candles");
        }
        Ok(fed)
    }

    /// The latest closed candle has already been evaluated
    async fn revisit_candle(&mut self, symbol: &str, candle: &Candle) -> DecisionReport {
        if let Some(intent) = self.pending.remove(symbol) {
            if intent.reference_candle_time == candle.open_time {
                tracing::info!(
                    symbol = %symbol,
                    side = %intent.side,
                    candle = %intent.reference_candle_time,
                    "Retrying order for current candle"
                );
                let action = self.execute(intent).await;
                return DecisionReport {
                    symbol: symbol.to_string(),
                    candle_time: Some(candle.open_time),
                    signal: None,
                    action,
                };
            }
        }

        if let Some(note) = self.rejected.get(symbol) {
            if note.candle_time == candle.open_time {
                return DecisionReport::no_op(
                    symbol,
                    Some(candle.open_time),
                    None,
                    format!("order rejected for this candle, waiting for a new signal: {}", note.reason),
                );
            }
        }

        DecisionReport::no_op(
            symbol,
            Some(candle.open_time),
            None,
            "awaiting next closed candle",
        )
    }

    /// Run the intent through the gate and remember what the next poll needs
    async fn execute(&mut self, intent: OrderIntent) -> CycleAction {
        let outcome = self.gate.execute(&intent, self.sink.as_ref()).await;
        let side = intent.side;
        let quantity = intent.quantity;

        match outcome {
            GateOutcome::DryRun => {
                self.account.record_simulated_fill(&intent).await;
                CycleAction::DryRun { side, quantity }
            }
            GateOutcome::Submitted(confirmation) => CycleAction::Submitted {
                side,
                quantity,
                order_id: confirmation.order_id,
            },
            GateOutcome::Retryable(err) => {
                let error = err.to_string();
                self.pending.insert(intent.symbol.clone(), intent);
                CycleAction::Retrying {
                    side,
                    quantity,
                    error,
                }
            }
            GateOutcome::Rejected(err) => {
                let error = err.to_string();
                self.rejected.insert(
                    intent.symbol.clone(),
                    RejectedNote {
                        candle_time: intent.reference_candle_time,
                        reason: error.clone(),
                    },
                );
                CycleAction::Rejected {
                    side,
                    quantity,
                    error,
                }
            }
            GateOutcome::Duplicate { last_acted } => {
                CycleAction::NoOp(format!("already acted on candle {}", last_acted.to_rfc3339()))
            }
            GateOutcome::InFlight => {
                CycleAction::NoOp("previous submission never settled".to_string())
            }
        }
    }

    async fn account_and_rules(
        &mut self,
        symbol: &str,
    ) -> Result<(AccountState, MarketRules), SourceError> {
        let account = self
            .call("account state", self.account.fetch_account_state(symbol))
            .await?;
        let rules = self.market_rules(symbol).await?;
        Ok((account, rules))
    }

    /// Lot-size rules, fetched once per symbol
    async fn market_rules(&mut self, symbol: &str) -> Result<MarketRules, SourceError> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(*rules);
        }

        let rules = self
            .call("market rules", self.candles.fetch_market_rules(symbol))
            .await?;
        tracing::info!(
            symbol = %symbol,
            min_order_size = %rules.min_order_size,
            step_size = %rules.step_size,
            "Loaded market rules"
        );
        self.rules.insert(symbol.to_string(), rules);
        Ok(rules)
    }

    async fn call<T>(
        &self,
        what: &str,
        request: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, SourceError> {
        tokio::time::timeout(self.call_timeout, request)
            .await
            .unwrap_or_else(|_| {
                Err(SourceError::Transient(format!(
                    "{} request timed out after {:?}",
                    what, self.call_timeout
                )))
            })
    }
}
