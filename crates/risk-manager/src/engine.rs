use std::collections::HashMap;

use analysis_core::Side;
use chrono::{DateTime, Utc};

use crate::models::*;

/// Tiered trailing-stop state machine for every open position.
///
/// Pure and synchronous; the caller performs the broker calls each
/// `TickOutcome` asks for and reports back via `mark_stop_pushed` / `close`.
pub struct PositionRiskEngine {
    config: TrailingConfig,
    positions: HashMap<String, Position>,
}

impl PositionRiskEngine {
    pub fn new(config: TrailingConfig) -> Self {
        Self {
            config,
            positions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TrailingConfig {
        &self.config
    }

    /// Start tracking a filled position. Replaces any stale state for the symbol.
    pub fn open_position(&mut self, new: NewPosition) -> Result<&Position, RiskError> {
        if !(new.entry_price.is_finite() && new.entry_price > 0.0) {
            return Err(RiskError::InvalidPrice {
                symbol: new.symbol,
                price: new.entry_price,
            });
        }
        if new.quantity == 0 {
            return Err(RiskError::InvalidPosition(format!("{} has zero quantity", new.symbol)));
        }

        let position = Position {
            symbol: new.symbol.clone(),
            side: new.side,
            entry_price: new.entry_price,
            quantity: new.quantity,
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            peak_price: new.entry_price,
            trailing_stop: None,
            breakeven_applied: false,
            partial_taken: false,
            last_pushed_stop: None,
            realized_pnl: 0.0,
            opened_at: new.opened_at,
        };

        tracing::info!(
            "Tracking {} {} x{} @ ${:.2} (stop={:?}, target={:?})",
            position.side,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.take_profit
        );

        let symbol = new.symbol;
        self.positions.insert(symbol.clone(), position);
        self.positions
            .get(&symbol)
            .ok_or(RiskError::UnknownPosition(symbol))
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn phase(&self, symbol: &str) -> PositionPhase {
        self.positions
            .get(symbol)
            .map(Position::phase)
            .unwrap_or(PositionPhase::Closed)
    }

    /// Advance one position by a price observation.
    pub fn evaluate(&mut self, symbol: &str, price: f64) -> Result<TickOutcome, RiskError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(RiskError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        let config = &self.config;
        let pos = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| RiskError::UnknownPosition(symbol.to_string()))?;

        let side = pos.side;
        let favourable = |a: f64, b: f64| match side {
            Side::Long => a > b,
            Side::Short => a < b,
        };

        if favourable(price, pos.peak_price) {
            pos.peak_price = price;
        }

        let profit = pos.profit_fraction(price);

        if !pos.breakeven_applied && profit >= config.breakeven_trigger() {
            pos.breakeven_applied = true;
            tracing::info!("{} reached breakeven tier at {:.2}% profit", symbol, profit * 100.0);
        }

        if let Some(tier) = config.tier_for(profit) {
            let candidate = trail_from_peak(side, pos.peak_price, tier.trail_fraction);
            let bounded = bound_by_breakeven(pos, candidate, config.breakeven_buffer);
            let ratcheted = match pos.trailing_stop {
                Some(current) if !favourable(bounded, current) => current,
                _ => bounded,
            };
            pos.trailing_stop = Some(ratcheted);
        }

        // Fixed stop-loss
        if let Some(stop) = pos.stop_loss {
            if !favourable(price, stop) {
                tracing::warn!("STOP-LOSS HIT: {} @ ${:.2} (stop=${:.2})", symbol, price, stop);
                return Ok(TickOutcome::Exit {
                    reason: ExitReason::StopLoss,
                    price,
                });
            }
        }

        // Partial profit, at most once per position. State changes only in
        // `confirm_partial`, so an unfilled sell is offered again next tick.
        if !pos.partial_taken && profit >= config.partial_take_profit {
            let quantity = (pos.quantity as f64 * config.partial_take_fraction).floor() as u64;
            if quantity > 0 && quantity < pos.quantity {
                let remaining = pos.quantity - quantity;
                let stop = pos
                    .trailing_stop
                    .unwrap_or_else(|| breakeven_floor(pos.side, pos.entry_price, config.breakeven_buffer));
                let take_profit = target_or_default(pos, config.default_take_profit);
                tracing::info!(
                    "PARTIAL PROFIT: {} selling {} of {} at {:.2}% profit",
                    symbol,
                    quantity,
                    pos.quantity,
                    profit * 100.0
                );
                return Ok(TickOutcome::PartialExit {
                    quantity,
                    remaining,
                    stop,
                    take_profit,
                });
            }
            pos.partial_taken = true;
            tracing::debug!("{}: partial size rounds to nothing, keeping full position", symbol);
        }

        if let Some(stop) = pos.trailing_stop {
            if !favourable(price, stop) {
                tracing::info!("TRAILING STOP HIT: {} @ ${:.2} (trail=${:.3})", symbol, price, stop);
                return Ok(TickOutcome::Exit {
                    reason: ExitReason::TrailingStop,
                    price,
                });
            }
        }

        if let Some(target) = pos.take_profit {
            if !favourable(target, price) {
                tracing::info!("TAKE-PROFIT HIT: {} @ ${:.2} (target=${:.2})", symbol, price, target);
                return Ok(TickOutcome::Exit {
                    reason: ExitReason::TakeProfit,
                    price,
                });
            }
        }

        if let Some(stop) = pos.trailing_stop {
            let baseline = pos.last_pushed_stop.or(pos.stop_loss);
            if should_push_stop(pos.side, stop, baseline, config.min_stop_change) {
                return Ok(TickOutcome::PushStop { stop });
            }
        }

        Ok(TickOutcome::Hold)
    }

    /// Record a stop the broker has accepted.
    pub fn mark_stop_pushed(&mut self, symbol: &str, stop: f64) -> Result<(), RiskError> {
        let pos = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| RiskError::UnknownPosition(symbol.to_string()))?;
        pos.last_pushed_stop = Some(stop);
        Ok(())
    }

    /// Drop a position whose entry never filled. Nothing was realized.
    pub fn discard(&mut self, symbol: &str) -> Option<Position> {
        let pos = self.positions.remove(symbol)?;
        tracing::info!("Stopped tracking unfilled {} entry", symbol);
        Some(pos)
    }

    /// Record a partial exit the broker has filled.
    ///
    /// Shrinks the position, fixes its target and returns the sold slice as a
    /// `PartialProfit` result. Its P&L is carried into the final `close`.
    pub fn confirm_partial(
        &mut self,
        symbol: &str,
        sold: u64,
        fill_price: f64,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, RiskError> {
        if !(fill_price.is_finite() && fill_price > 0.0) {
            return Err(RiskError::InvalidPrice {
                symbol: symbol.to_string(),
                price: fill_price,
            });
        }
        let default_take_profit = self.config.default_take_profit;
        let pos = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| RiskError::UnknownPosition(symbol.to_string()))?;
        if pos.partial_taken {
            return Err(RiskError::InvalidPosition(format!("{} already took its partial", symbol)));
        }
        if sold == 0 || sold >= pos.quantity {
            return Err(RiskError::InvalidPosition(format!(
                "cannot sell {} of {} {} as a partial",
                sold, pos.quantity, symbol
            )));
        }

        let target = target_or_default(pos, default_take_profit);
        pos.take_profit = Some(target);
        pos.quantity -= sold;
        pos.partial_taken = true;

        let sign = pos.side.sign();
        let pnl = round_cents(sign * (fill_price - pos.entry_price) * sold as f64);
        pos.realized_pnl += pnl;

        tracing::info!(
            "Partial exit filled: {} sold {} @ ${:.2}, P&L=${:+.2}, {} left",
            symbol,
            sold,
            fill_price,
            pnl,
            pos.quantity
        );

        Ok(ClosedPosition {
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price: fill_price,
            quantity: sold,
            realized_pnl: pnl,
            pnl_pct: round_cents(sign * (fill_price - pos.entry_price) / pos.entry_price * 100.0),
            reason: ExitReason::PartialProfit,
            opened_at: pos.opened_at,
            closed_at: now,
            duration_secs: (now - pos.opened_at).num_seconds().max(0),
        })
    }

    /// Forget a position and report its realized result.
    ///
    /// `broker_pnl` covers the shares still held and is preferred over a
    /// computed figure. P&L from an earlier partial exit is added on top.
    pub fn close(
        &mut self,
        symbol: &str,
        reason: ExitReason,
        exit_price: f64,
        broker_pnl: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        let pos = self.positions.remove(symbol)?;

        let sign = pos.side.sign();
        let computed = sign * (exit_price - pos.entry_price) * pos.quantity as f64;
        let realized_pnl = broker_pnl.filter(|p| p.is_finite()).unwrap_or(computed) + pos.realized_pnl;
        let pnl_pct = sign * (exit_price - pos.entry_price) / pos.entry_price * 100.0;
        let duration_secs = (now - pos.opened_at).num_seconds().max(0);

        tracing::info!(
            "Trade closed: {} | {} | P&L=${:+.2} ({:+.1}%)",
            symbol,
            reason,
            realized_pnl,
            pnl_pct
        );

        Some(ClosedPosition {
            symbol: pos.symbol,
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            realized_pnl: round_cents(realized_pnl),
            pnl_pct: round_cents(pnl_pct),
            reason,
            opened_at: pos.opened_at,
            closed_at: now,
            duration_secs,
        })
    }
}

impl Default for PositionRiskEngine {
    fn default() -> Self {
        Self::new(TrailingConfig::default())
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn target_or_default(pos: &Position, default_take_profit: f64) -> f64 {
    pos.take_profit
        .unwrap_or_else(|| pos.entry_price * (1.0 + pos.side.sign() * default_take_profit))
}

fn trail_from_peak(side: Side, peak: f64, trail_fraction: f64) -> f64 {
    peak * (1.0 - side.sign() * trail_fraction)
}

fn breakeven_floor(side: Side, entry: f64, buffer: f64) -> f64 {
    entry * (1.0 + side.sign() * buffer)
}

/// The trailing stop may never sit looser than the breakeven level.
fn bound_by_breakeven(pos: &Position, candidate: f64, buffer: f64) -> f64 {
    let floor = breakeven_floor(pos.side, pos.entry_price, buffer);
    match pos.side {
        Side::Long => candidate.max(floor),
        Side::Short => candidate.min(floor),
    }
}

/// A new stop is worth pushing when it tightens the baseline by at least `min_change`.
pub fn should_push_stop(side: Side, stop: f64, baseline: Option<f64>, min_change: f64) -> bool {
    let Some(baseline) = baseline else {
        return true;
    };
    if baseline <= 0.0 {
        return true;
    }
    let tighter = side.sign() * (stop - baseline);
    tighter > 0.0 && tighter / baseline >= min_change
}
