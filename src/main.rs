use anyhow::{Context, Result};
use clap::Parser;
use crossbot::api::binance::{BINANCE_API_BASE, BINANCE_TESTNET_BASE};
use crossbot::api::{
    AccountSource, BinanceClient, BinanceCredentials, CandleSource, OrderSink, PaperAccount,
};
use crossbot::{BotConfig, BotLoop, ConfigError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// SMA crossover trading bot for Binance spot
#[derive(Parser, Debug)]
#[command(name = "crossbot", version, about)]
struct Args {
    /// TOML config file (missing file means defaults + env)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log decisions instead of submitting orders
    #[arg(long)]
    dry_run: Option<bool>,

    /// Route orders to the Binance spot testnet
    #[arg(long)]
    sandbox: Option<bool>,

    /// Run a single decision cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level for crossbot targets (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config =
        BotConfig::load(Some(&args.config)).context("Failed to load configuration")?;
    if let Some(dry_run) = args.dry_run {
        config.dry_run = dry_run;
    }
    if let Some(sandbox) = args.sandbox {
        config.sandbox = sandbox;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    setup_logging(&config.log_level);

    tracing::info!(
        symbol = %config.symbol,
        timeframe = %config.timeframe,
        fast = config.fast_window,
        slow = config.slow_window,
        dry_run = config.dry_run,
        sandbox = config.sandbox,
        "🚀 crossbot starting"
    );

    let mut bot = build_bot(&config)?;

    match bot.warm_up().await {
        Ok(fed) => tracing::info!("Warm-up fed {} closed candles", fed),
        Err(e) => tracing::warn!("Warm-up failed, averages will fill from live candles: {}", e),
    }

    if args.once {
        bot.run_once().await;
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        _ = bot.run() => {}
    }

    tracing::info!("👋 crossbot stopped");
    Ok(())
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("crossbot={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_bot(config: &BotConfig) -> Result<BotLoop> {
    let credentials = BinanceCredentials::from_env();
    if credentials.is_none() && !config.dry_run {
        return Err(ConfigError::Invalid(
            "live trading requires BINANCE_API_KEY and BINANCE_SECRET".to_string(),
        )
        .into());
    }

    let client = BinanceClient::new(credentials, config.sandbox, config.request_timeout())?
        .with_base_urls(
            config
                .exchange_base_url
                .as_deref()
                .unwrap_or(BINANCE_API_BASE),
            config
                .exchange_sandbox_url
                .as_deref()
                .unwrap_or(BINANCE_TESTNET_BASE),
        );
    let client = Arc::new(client);

    let account: Arc<dyn AccountSource> = if client.has_credentials() {
        client.clone()
    } else {
        tracing::info!(
            balance = %config.paper_balance,
            "No API credentials, using paper account for dry run"
        );
        Arc::new(PaperAccount::new(config.paper_balance))
    };
    let candles: Arc<dyn CandleSource> = client.clone();
    let sink: Arc<dyn OrderSink> = client;

    Ok(BotLoop::new(config, candles, account, sink)?)
}
