use analysis_core::Side;
use broker_trait::BrokerClient;

use crate::models::*;

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Pre-trade admission control and sizing. Owns the daily halt flag.
pub struct RiskGate {
    params: RiskParameters,
    halted: Option<String>,
}

impl RiskGate {
    pub fn new(params: RiskParameters) -> Self {
        Self { params, halted: None }
    }

    pub fn parameters(&self) -> &RiskParameters {
        &self.params
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Decide whether a new position may be opened.
    ///
    /// Fails closed: any account or position query error refuses the trade.
    /// A daily-loss breach halts trading until `reset_daily`.
    pub async fn check_can_trade(&mut self, broker: &dyn BrokerClient) -> RiskCheck {
        if self.halted.is_some() {
            return RiskCheck::refuse("Trading halted due to daily loss limit");
        }

        let account = match broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                tracing::error!("Failed to check account: {:#}", e);
                return RiskCheck::refuse(format!("Account check failed: {}", e));
            }
        };

        if account.day_pnl_pct < 0.0 {
            let loss = account.day_pnl_pct.abs() / 100.0;
            if loss >= self.params.daily_loss_limit_fraction {
                let reason = format!("Daily loss limit hit ({:.1}%)", loss * 100.0);
                tracing::warn!(
                    "DAILY LOSS LIMIT HIT: {:.1}% >= {:.1}%. Trading halted.",
                    loss * 100.0,
                    self.params.daily_loss_limit_fraction * 100.0
                );
                self.halted = Some(reason.clone());
                return RiskCheck::refuse(reason);
            }
        }

        let positions = match broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!("Failed to check positions: {:#}", e);
                return RiskCheck::refuse(format!("Position check failed: {}", e));
            }
        };

        if positions.len() >= self.params.max_positions {
            return RiskCheck::refuse(format!(
                "Max positions reached ({}/{})",
                positions.len(),
                self.params.max_positions
            ));
        }

        RiskCheck::allow()
    }

    /// Whole shares affordable with the configured slice of equity.
    pub fn size_for_equity(&self, equity: f64, price: f64) -> PositionSize {
        if !(price.is_finite() && price > 0.0) {
            return PositionSize {
                quantity: 0,
                reason: format!("Invalid price ${:.2}", price),
            };
        }
        if !(equity.is_finite() && equity > 0.0) {
            return PositionSize {
                quantity: 0,
                reason: format!("No equity available (${:.2})", equity),
            };
        }

        let max_dollars = equity * self.params.max_position_fraction;
        let quantity = (max_dollars / price).floor();

        if quantity < 1.0 {
            return PositionSize {
                quantity: 0,
                reason: format!("Position too small: ${:.2} < ${:.2}", max_dollars, price),
            };
        }

        PositionSize {
            quantity: quantity as u64,
            reason: "OK".to_string(),
        }
    }

    pub async fn calculate_position_size(&self, broker: &dyn BrokerClient, price: f64) -> PositionSize {
        let account = match broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                tracing::error!("Position sizing failed: {:#}", e);
                return PositionSize {
                    quantity: 0,
                    reason: format!("Position sizing error: {}", e),
                };
            }
        };

        let equity = account.equity_f64();
        let size = self.size_for_equity(equity, price);
        if size.quantity > 0 {
            tracing::info!(
                "Position size: {} shares @ ${:.2} = ${:.2} ({:.0}% of ${:.2})",
                size.quantity,
                price,
                size.quantity as f64 * price,
                self.params.max_position_fraction * 100.0,
                equity
            );
        }
        size
    }

    /// Stop and target for a new entry.
    ///
    /// External levels win when they sit on the correct side of entry;
    /// otherwise fixed percentage offsets are used.
    pub fn calculate_stops(
        &self,
        entry_price: f64,
        side: Side,
        external_stop: Option<f64>,
        external_target: Option<f64>,
    ) -> StopLevels {
        let sign = side.sign();

        let stop_valid = |s: f64| s.is_finite() && s > 0.0 && sign * (entry_price - s) > 0.0;
        let target_valid = |t: f64| t.is_finite() && t > 0.0 && sign * (t - entry_price) > 0.0;

        let stop_loss = match external_stop {
            Some(s) if stop_valid(s) => s,
            Some(s) => {
                tracing::warn!("Ignoring {} stop ${:.2} on wrong side of entry ${:.2}", side, s, entry_price);
                round_cents(entry_price * (1.0 - sign * self.params.stop_loss_fraction))
            }
            None => round_cents(entry_price * (1.0 - sign * self.params.stop_loss_fraction)),
        };

        let take_profit = match external_target {
            Some(t) if target_valid(t) => t,
            Some(t) => {
                tracing::warn!("Ignoring {} target ${:.2} on wrong side of entry ${:.2}", side, t, entry_price);
                round_cents(entry_price * (1.0 + sign * self.params.take_profit_fraction))
            }
            None => round_cents(entry_price * (1.0 + sign * self.params.take_profit_fraction)),
        };

        StopLevels { stop_loss, take_profit }
    }

    /// Clear the daily halt. Called once per session at market open.
    pub fn reset_daily(&mut self) {
        self.halted = None;
        tracing::info!("Daily risk limits reset");
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new(RiskParameters::default())
    }
}
