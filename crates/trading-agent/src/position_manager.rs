use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::Side;
use anyhow::{anyhow, Context, Result};
use broker_trait::{price_to_decimal, BrokerClient, BrokerOrderRequest, BrokerOrderSide, BrokerPosition, ProtectiveOrderRequest};
use chrono::{DateTime, Utc};
use risk_manager::{ClosedPosition, ExitReason, NewPosition, Position, PositionRiskEngine, TickOutcome, TrailingConfig};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::store::TradeStore;
use crate::types::SweepReport;

/// Time for cancels to settle at the broker before the follow-up order.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long a submitted entry may stay missing from the broker's positions.
const DEFAULT_FILL_GRACE_SECS: i64 = 120;

struct ManagerState {
    engine: PositionRiskEngine,
    /// Last observed price per tracked symbol, used when a position vanishes.
    last_prices: HashMap<String, f64>,
    /// Entries the broker has not reported as held yet, by submit time.
    awaiting_fill: HashMap<String, DateTime<Utc>>,
}

/// Owns the risk engine and carries out what it asks for at the broker.
pub struct PositionManager {
    broker: Arc<dyn BrokerClient>,
    store: TradeStore,
    state: Mutex<ManagerState>,
    settle_delay: Duration,
    fill_grace: chrono::Duration,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn BrokerClient>, store: TradeStore, config: TrailingConfig) -> Self {
        Self {
            broker,
            store,
            state: Mutex::new(ManagerState {
                engine: PositionRiskEngine::new(config),
                last_prices: HashMap::new(),
                awaiting_fill: HashMap::new(),
            }),
            settle_delay: DEFAULT_SETTLE_DELAY,
            fill_grace: chrono::Duration::seconds(DEFAULT_FILL_GRACE_SECS),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_fill_grace(mut self, grace: chrono::Duration) -> Self {
        self.fill_grace = grace;
        self
    }

    /// Start managing an entry the broker just accepted.
    ///
    /// Until the broker reports the position it is left alone; an entry still
    /// missing after the fill grace is cancelled.
    pub async fn track(&self, new: NewPosition) -> Result<()> {
        let mut state = self.state.lock().await;
        let symbol = new.symbol.clone();
        let submitted_at = new.opened_at;
        let entry_price = new.entry_price;
        state.engine.open_position(new)?;
        state.last_prices.insert(symbol.clone(), entry_price);
        state.awaiting_fill.insert(symbol, submitted_at);
        Ok(())
    }

    pub async fn is_tracked(&self, symbol: &str) -> bool {
        self.state.lock().await.engine.contains(symbol)
    }

    pub async fn tracked_symbols(&self) -> Vec<String> {
        self.state.lock().await.engine.symbols()
    }

    pub async fn snapshot(&self, symbol: &str) -> Option<Position> {
        self.state.lock().await.engine.get(symbol).cloned()
    }

    /// Run one price observation (a streamed close) through the risk engine.
    ///
    /// Symbols that are not held, or whose entry has not filled, are ignored.
    pub async fn observe(&self, symbol: &str, price: f64, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut state = self.state.lock().await;
        if !state.engine.contains(symbol) || state.awaiting_fill.contains_key(symbol) {
            return report;
        }

        state.last_prices.insert(symbol.to_string(), price);
        self.evaluate(&mut state, symbol, price, None, now, &mut report).await;

        if !report.is_quiet() {
            tracing::info!(
                "{} @ ${:.2}: {} stops pushed, {} partials, {} closed, {} errors",
                symbol,
                price,
                report.stops_pushed.len(),
                report.partial_exits.len(),
                report.closed.len(),
                report.errors.len()
            );
        }
        report
    }

    /// One pass over every broker position: reconcile, evaluate, act.
    ///
    /// Failures are collected per symbol in the report; only a failed
    /// position query ends the sweep early.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let mut positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!("Position sweep aborted, could not fetch positions: {:#}", e);
                report.errors.push(("*".to_string(), format!("{:#}", e)));
                return report;
            }
        };
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut state = self.state.lock().await;

        for symbol in state.engine.symbols() {
            if positions.iter().any(|p| p.symbol == symbol) {
                continue;
            }
            if let Some(&submitted_at) = state.awaiting_fill.get(&symbol) {
                if now - submitted_at < self.fill_grace {
                    tracing::debug!("{}: entry not filled yet", symbol);
                } else {
                    self.abandon_entry(&mut state, &symbol).await;
                    report.cancelled.push(symbol);
                }
                continue;
            }

            let price = state
                .last_prices
                .remove(&symbol)
                .or_else(|| state.engine.get(&symbol).map(|p| p.entry_price))
                .unwrap_or_default();
            tracing::warn!("{} no longer held at {}, closing locally", symbol, self.broker.broker_name());
            if let Some(closed) = state
                .engine
                .close(&symbol, ExitReason::ClosedExternally, price, None, now)
            {
                self.record_close(&closed).await;
                report.closed.push(closed);
            }
        }

        for broker_position in &positions {
            let symbol = broker_position.symbol.as_str();

            if state.awaiting_fill.remove(symbol).is_some() {
                tracing::info!("{} entry filled", symbol);
                self.mark_filled(symbol, now).await;
            } else if !state.engine.contains(symbol) {
                match self.adopt(&mut state.engine, broker_position, now).await {
                    Ok(true) => {
                        report.adopted.push(symbol.to_string());
                        self.mark_filled(symbol, now).await;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        report.errors.push((symbol.to_string(), format!("{:#}", e)));
                        continue;
                    }
                }
            }

            let price = broker_position.current_price_f64();
            state.last_prices.insert(symbol.to_string(), price);
            let broker_pnl = Some(broker_position.unrealized_pl_f64());
            self.evaluate(&mut state, symbol, price, broker_pnl, now, &mut report)
                .await;

            if let Some(tracked) = state.engine.get(symbol) {
                if let Err(e) = self.store.upsert_position(broker_position, tracked).await {
                    tracing::warn!("Failed to store position {}: {:#}", symbol, e);
                }
            }
        }

        if !report.is_quiet() {
            tracing::info!(
                "Position sweep: {} evaluated, {} stops pushed, {} partials, {} closed, {} adopted, {} cancelled, {} errors",
                report.evaluated,
                report.stops_pushed.len(),
                report.partial_exits.len(),
                report.closed.len(),
                report.adopted.len(),
                report.cancelled.len(),
                report.errors.len()
            );
        }
        report
    }

    async fn evaluate(
        &self,
        state: &mut ManagerState,
        symbol: &str,
        price: f64,
        broker_pnl: Option<f64>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        report.evaluated += 1;

        let outcome = match state.engine.evaluate(symbol, price) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", symbol, e);
                report.errors.push((symbol.to_string(), e.to_string()));
                return;
            }
        };

        if let Err(e) = self
            .apply(state, symbol, price, outcome, broker_pnl, now, report)
            .await
        {
            tracing::error!("Risk action for {} failed: {:#}", symbol, e);
            report.errors.push((symbol.to_string(), format!("{:#}", e)));
        }
    }

    /// Track a broker position this process did not open.
    ///
    /// Levels come from the store's open trade when one matches, otherwise the
    /// position starts unprotected and gets a stop on its first push.
    async fn adopt(
        &self,
        engine: &mut PositionRiskEngine,
        broker_position: &BrokerPosition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let symbol = &broker_position.symbol;
        let quantity = broker_position.whole_shares();
        if quantity == 0 {
            tracing::debug!("{}: fractional-only position, not tracked", symbol);
            return Ok(false);
        }

        let recorded = match self.store.open_trade(symbol).await {
            Ok(trade) => trade.filter(|t| t.side == broker_position.side),
            Err(e) => {
                tracing::warn!("Could not load open trade for {}: {:#}", symbol, e);
                None
            }
        };

        let new = match recorded {
            Some(trade) => NewPosition {
                symbol: symbol.clone(),
                side: trade.side,
                entry_price: trade.entry_price,
                quantity,
                stop_loss: trade.stop_loss,
                take_profit: trade.take_profit,
                opened_at: trade.opened_at,
            },
            None => NewPosition {
                symbol: symbol.clone(),
                side: broker_position.side,
                entry_price: broker_position.avg_entry_price_f64(),
                quantity,
                stop_loss: None,
                take_profit: None,
                opened_at: now,
            },
        };

        tracing::info!(
            "Adopting {} {} x{} @ ${:.2}",
            new.side,
            symbol,
            quantity,
            new.entry_price
        );
        engine.open_position(new)?;
        Ok(true)
    }

    /// Give up on an entry the broker never filled.
    async fn abandon_entry(&self, state: &mut ManagerState, symbol: &str) {
        tracing::warn!(
            "{} entry not filled within {}s, cancelling",
            symbol,
            self.fill_grace.num_seconds()
        );
        if let Err(e) = self.broker.cancel_orders_for_symbol(symbol).await {
            tracing::warn!("Cancel of unfilled entry {} failed: {:#}", symbol, e);
        }
        state.awaiting_fill.remove(symbol);
        state.last_prices.remove(symbol);
        state.engine.discard(symbol);
        if let Err(e) = self.store.cancel_trade(symbol).await {
            tracing::warn!("Failed to record cancelled entry {}: {:#}", symbol, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        state: &mut ManagerState,
        symbol: &str,
        price: f64,
        outcome: TickOutcome,
        broker_pnl: Option<f64>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        match outcome {
            TickOutcome::Hold => Ok(()),

            TickOutcome::PushStop { stop } => {
                self.push_stop(&mut state.engine, symbol, stop).await?;
                report.stops_pushed.push((symbol.to_string(), stop));
                Ok(())
            }

            TickOutcome::PartialExit {
                quantity,
                remaining,
                stop,
                take_profit,
            } => {
                let side = state
                    .engine
                    .get(symbol)
                    .map(|p| p.side)
                    .ok_or_else(|| anyhow!("{} vanished mid-sweep", symbol))?;

                if let Err(e) = self.broker.cancel_orders_for_symbol(symbol).await {
                    tracing::warn!("Cancel before partial exit failed for {}: {:#}", symbol, e);
                }
                tokio::time::sleep(self.settle_delay).await;

                let sell = BrokerOrderRequest {
                    symbol: symbol.to_string(),
                    qty: Decimal::from(quantity),
                    side: BrokerOrderSide::to_close(side),
                };
                let order = match self.broker.place_market_order(sell).await {
                    Ok(order) => order,
                    Err(e) => {
                        // Orders were cancelled, so the whole position needs cover again
                        self.protect(symbol, side, quantity + remaining, stop, take_profit)
                            .await
                            .context("re-protecting after failed partial exit")?;
                        return Err(e.context(format!("partial exit of {} {}", quantity, symbol)));
                    }
                };

                let fill_price = order.filled_avg_price_f64().unwrap_or(price);
                let slice = state.engine.confirm_partial(symbol, quantity, fill_price, now)?;
                report.partial_exits.push((symbol.to_string(), quantity));
                if let Err(e) = self.store.record_partial_exit(&slice, remaining).await {
                    tracing::warn!("Failed to record partial exit for {}: {:#}", symbol, e);
                }

                self.protect(symbol, side, remaining, stop, take_profit).await?;
                state.engine.mark_stop_pushed(symbol, stop)?;
                Ok(())
            }

            TickOutcome::Exit { reason, price } => {
                if let Err(e) = self.broker.cancel_orders_for_symbol(symbol).await {
                    tracing::warn!("Cancel before exit failed for {}: {:#}", symbol, e);
                }
                tokio::time::sleep(self.settle_delay).await;

                let order = self
                    .broker
                    .close_position(symbol)
                    .await
                    .with_context(|| format!("closing {} on {}", symbol, reason))?;

                let exit_price = order.filled_avg_price_f64().unwrap_or(price);
                state.last_prices.remove(symbol);
                if let Some(closed) = state.engine.close(symbol, reason, exit_price, broker_pnl, now) {
                    self.record_close(&closed).await;
                    report.closed.push(closed);
                }
                Ok(())
            }
        }
    }

    async fn push_stop(&self, engine: &mut PositionRiskEngine, symbol: &str, stop: f64) -> Result<()> {
        let new_stop = price_to_decimal(stop).ok_or_else(|| anyhow!("invalid stop {} for {}", stop, symbol))?;

        match self.broker.replace_stop(symbol, new_stop).await {
            Ok(true) => {
                tracing::info!("Stop for {} moved to ${}", symbol, new_stop);
            }
            Ok(false) => {
                tracing::warn!("{} has no live stop order, placing protective orders", symbol);
                self.reprotect(engine, symbol, stop).await?;
            }
            Err(e) => {
                let position = engine
                    .get(symbol)
                    .ok_or_else(|| anyhow!("{} vanished mid-sweep", symbol))?;
                if position.stop_loss.is_some() || position.last_pushed_stop.is_some() {
                    // Keep the previous stop; the next evaluation retries
                    return Err(e.context(format!("replacing stop for {}", symbol)));
                }
                tracing::warn!("No stop to replace for {} ({:#}), placing protective orders", symbol, e);
                self.reprotect(engine, symbol, stop).await?;
            }
        }

        engine.mark_stop_pushed(symbol, stop)?;
        Ok(())
    }

    /// Replace whatever is left at the broker with a fresh stop + target pair.
    async fn reprotect(&self, engine: &PositionRiskEngine, symbol: &str, stop: f64) -> Result<()> {
        let position = engine
            .get(symbol)
            .ok_or_else(|| anyhow!("{} vanished mid-sweep", symbol))?;
        let take_profit = position.take_profit.unwrap_or_else(|| {
            position.entry_price * (1.0 + position.side.sign() * engine.config().default_take_profit)
        });

        // A lone target leg would hold the shares the new pair needs
        if let Err(e) = self.broker.cancel_orders_for_symbol(symbol).await {
            tracing::warn!("Cancel before re-protecting {} failed: {:#}", symbol, e);
        }
        tokio::time::sleep(self.settle_delay).await;

        self.protect(symbol, position.side, position.quantity, stop, take_profit)
            .await
    }

    async fn protect(
        &self,
        symbol: &str,
        side: Side,
        quantity: u64,
        stop: f64,
        take_profit: f64,
    ) -> Result<()> {
        let request = ProtectiveOrderRequest {
            symbol: symbol.to_string(),
            qty: Decimal::from(quantity),
            position_side: side,
            stop_loss: price_to_decimal(stop).ok_or_else(|| anyhow!("invalid stop {}", stop))?,
            take_profit: price_to_decimal(take_profit)
                .ok_or_else(|| anyhow!("invalid take-profit {}", take_profit))?,
        };
        self.broker
            .place_protective_orders(request)
            .await
            .with_context(|| format!("protecting {} {}", quantity, symbol))?;
        tracing::info!(
            "Protected {} x{}: stop ${:.2}, target ${:.2}",
            symbol,
            quantity,
            stop,
            take_profit
        );
        Ok(())
    }

    async fn mark_filled(&self, symbol: &str, now: DateTime<Utc>) {
        if let Err(e) = self.store.mark_trade_filled(symbol, now).await {
            tracing::warn!("Failed to mark {} filled: {:#}", symbol, e);
        }
    }

    async fn record_close(&self, closed: &ClosedPosition) {
        match self.store.close_trade(closed).await {
            Ok(0) => tracing::debug!("No open trade row for {}", closed.symbol),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to record close of {}: {:#}", closed.symbol, e),
        }
        if let Err(e) = self.store.delete_position(&closed.symbol).await {
            tracing::warn!("Failed to drop stored position {}: {:#}", closed.symbol, e);
        }
    }
}
