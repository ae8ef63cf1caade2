use std::sync::Arc;
use std::time::Duration;

use alpaca_broker::{AlpacaBarStream, AlpacaClient};
use anyhow::{Context, Result};
use broker_trait::BrokerClient;
use chrono::Utc;
use risk_manager::{RiskGate, TrailingConfig};
use tokio::signal::unix::SignalKind;
use tokio::sync::{broadcast, Mutex};
use tokio::time;

mod aggregator;
mod config;
mod oracle;
mod position_manager;
mod session;
mod store;
mod strategy;
mod types;

#[cfg(test)]
mod test_support;

use aggregator::BarAggregator;
use config::AgentConfig;
use oracle::LlmOracle;
use position_manager::PositionManager;
use session::DailyReset;
use store::TradeStore;
use strategy::{Strategy, StrategyConfig};
use types::BarOutcome;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting candle trading agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Watchlist: {}", config.watchlist.join(", "));
    tracing::info!("  Timeframe: {}", config.timeframe);
    tracing::info!(
        "  Position size: {:.1}% of equity, max {} positions",
        config.risk.max_position_fraction * 100.0,
        config.risk.max_positions
    );
    tracing::info!(
        "  Stops: {:.1}% loss / {:.1}% target, daily loss limit {:.1}%",
        config.risk.stop_loss_fraction * 100.0,
        config.risk.take_profit_fraction * 100.0,
        config.risk.daily_loss_limit_fraction * 100.0
    );
    tracing::info!("  Position check every {}s", config.position_check_interval_secs);
    if config.anthropic_api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY not set: every signal will be skipped");
    }

    // 3. Broker
    let alpaca = Arc::new(AlpacaClient::new(
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
        config.alpaca_base_url.clone(),
        config.alpaca_data_url.clone(),
    )?);

    // 4. Safety gate: paper by default, live requires LIVE_TRADING_APPROVED=yes
    if !alpaca.is_paper() {
        if !config.live_trading_approved {
            tracing::error!(
                "ALPACA_BASE_URL points to live trading ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or use \
                 https://paper-api.alpaca.markets for paper.",
                alpaca.base_url()
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE, REAL MONEY AT RISK ({})", alpaca.base_url());
    } else {
        tracing::info!("Paper trading mode ({})", alpaca.base_url());
    }
    let broker: Arc<dyn BrokerClient> = alpaca.clone();

    // 5. Store
    let store = TradeStore::connect(&config.database_url).await?;
    store.init_tables().await?;
    tracing::info!("Trade store ready ({})", config.database_url);

    // 6. Startup account check is fatal: nothing works without the broker
    let account = broker
        .get_account()
        .await
        .context("Alpaca connection failed")?;
    tracing::info!(
        "{} connected: equity=${:.2} buying_power=${}",
        broker.broker_name(),
        account.equity_f64(),
        account.buying_power
    );

    // 7. Components
    let oracle = Arc::new(LlmOracle::new(
        config.anthropic_base_url.clone(),
        config.anthropic_api_key.clone(),
        config.ai_model.clone(),
        Duration::from_secs(config.ai_timeout_secs),
    )?);
    let gate = Arc::new(Mutex::new(RiskGate::new(config.risk.clone())));
    let positions = Arc::new(PositionManager::new(
        broker.clone(),
        store.clone(),
        TrailingConfig::default(),
    ));
    let mut strategy = Strategy::new(
        broker.clone(),
        oracle,
        gate.clone(),
        positions.clone(),
        store.clone(),
        StrategyConfig {
            timeframe: config.timeframe,
            history_bars: config.history_bars,
            min_history_bars: config.min_history_bars,
            min_ai_confidence: config.min_ai_confidence,
        },
    );

    // 8. Backfill, then seed the analysis windows from the store
    backfill(&alpaca, &store, &config).await;
    for symbol in &config.watchlist {
        match store.recent_candles(symbol, config.timeframe, config.history_bars).await {
            Ok(bars) => strategy.seed(symbol, bars),
            Err(e) => tracing::warn!("Could not load history for {}: {:#}", symbol, e),
        }
    }

    // 9. Adopt anything already open before the first bar arrives
    let report = positions.sweep(Utc::now()).await;
    if !report.adopted.is_empty() {
        tracing::info!("Adopted existing positions: {}", report.adopted.join(", "));
    }

    // 10. Bar stream
    let (stream, mut bars_rx) = AlpacaBarStream::new(
        config.alpaca_stream_url.clone(),
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
        &config.watchlist,
    );
    let stream_shutdown = stream.shutdown_handle();
    let stream_task = tokio::spawn(async move { stream.run().await });

    let mut aggregator = BarAggregator::new(config.timeframe);
    let mut daily_reset = DailyReset::starting_at(Utc::now());

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut interval = time::interval(Duration::from_secs(config.position_check_interval_secs));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    tracing::info!("Agent running. Waiting for bars...");

    loop {
        tokio::select! {
            received = bars_rx.recv() => {
                match received {
                    Ok((symbol, minute_bar)) => {
                        positions.observe(&symbol, minute_bar.close, Utc::now()).await;
                        for bar in aggregator.push(&symbol, minute_bar) {
                            if let BarOutcome::Entered(entry) = strategy.on_bar(&symbol, bar).await {
                                tracing::info!(
                                    "Trade executed: {} {} x{} @ ${:.2}",
                                    entry.side,
                                    entry.symbol,
                                    entry.quantity,
                                    entry.entry_price
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Bar handler lagged, {} bars dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::error!("Bar stream closed");
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                let now = Utc::now();
                if daily_reset.due(now) {
                    gate.lock().await.reset_daily();
                }
                snapshot_account(broker.as_ref(), &store).await;
                positions.sweep(now).await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, stopping agent...");
                break;
            }
        }
    }

    stream_shutdown.notify_one();
    match time::timeout(Duration::from_secs(10), stream_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Bar stream task ended abnormally: {}", e),
        Err(_) => tracing::warn!("Bar stream did not stop within 10s"),
    }

    let open = positions.tracked_symbols().await;
    if !open.is_empty() {
        tracing::info!("Leaving {} positions under broker-side protection: {}", open.len(), open.join(", "));
    }
    tracing::info!("Agent stopped");
    Ok(())
}

/// Load recent history into the store. Failures are per symbol and never fatal.
async fn backfill(alpaca: &AlpacaClient, store: &TradeStore, config: &AgentConfig) {
    tracing::info!("Backfilling {} {} bars per symbol...", config.backfill_bars, config.timeframe);
    for symbol in &config.watchlist {
        let bars = match alpaca.get_bars(symbol, config.timeframe, config.backfill_bars).await {
            Ok(bars) => bars,
            Err(e) => {
                tracing::error!("  {}: backfill failed: {:#}", symbol, e);
                continue;
            }
        };
        let mut stored = 0;
        for bar in &bars {
            match store.upsert_candle(symbol, config.timeframe, bar).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!("  {}: failed to store candle: {:#}", symbol, e),
            }
        }
        tracing::info!("  {}: {} candles loaded", symbol, stored);
    }
}

async fn snapshot_account(broker: &dyn BrokerClient, store: &TradeStore) {
    let account = match broker.get_account().await {
        Ok(account) => account,
        Err(e) => {
            tracing::error!("Snapshot failed: {:#}", e);
            return;
        }
    };
    let open_positions = match broker.get_positions().await {
        Ok(positions) => positions.len(),
        Err(e) => {
            tracing::error!("Snapshot failed: {:#}", e);
            return;
        }
    };
    if let Err(e) = store.insert_account_snapshot(&account, open_positions).await {
        tracing::warn!("Failed to store account snapshot: {:#}", e);
    }
    tracing::debug!(
        "Snapshot: equity=${:.2} cash=${} day_pnl=${} positions={}",
        account.equity_f64(),
        account.cash,
        account.day_pnl,
        open_positions
    );
}
