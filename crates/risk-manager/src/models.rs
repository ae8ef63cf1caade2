use std::fmt;

use analysis_core::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("No tracked position for {0}")]
    UnknownPosition(String),

    #[error("Invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("Invalid position: {0}")]
    InvalidPosition(String),
}

/// Pre-trade limits. All values are fractions (0.05 = 5%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub max_position_fraction: f64,
    pub max_positions: usize,
    pub stop_loss_fraction: f64,
    pub take_profit_fraction: f64,
    /// Maximum daily loss before trading halts for the rest of the session
    pub daily_loss_limit_fraction: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.05,
            max_positions: 3,
            stop_loss_fraction: 0.02,
            take_profit_fraction: 0.04,
            daily_loss_limit_fraction: 0.03,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheck {
    pub can_trade: bool,
    pub reason: String,
}

impl RiskCheck {
    pub fn allow() -> Self {
        Self {
            can_trade: true,
            reason: "OK".to_string(),
        }
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        Self {
            can_trade: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub quantity: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Trail `trail_fraction` behind the peak once profit reaches `min_profit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailTier {
    pub min_profit: f64,
    pub trail_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Ordered tightest first. The last tier is the breakeven trigger.
    pub tiers: Vec<TrailTier>,
    pub breakeven_buffer: f64,
    pub partial_take_profit: f64,
    pub partial_take_fraction: f64,
    /// Smallest relative stop move worth sending to the broker
    pub min_stop_change: f64,
    /// Target used when re-protecting a position that had none
    pub default_take_profit: f64,
}

impl TrailingConfig {
    pub fn breakeven_trigger(&self) -> f64 {
        self.tiers.last().map(|t| t.min_profit).unwrap_or(f64::INFINITY)
    }

    /// Tightest tier whose threshold `profit` meets.
    pub fn tier_for(&self, profit: f64) -> Option<&TrailTier> {
        self.tiers.iter().find(|t| profit >= t.min_profit)
    }
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TrailTier { min_profit: 0.035, trail_fraction: 0.003 },
                TrailTier { min_profit: 0.025, trail_fraction: 0.004 },
                TrailTier { min_profit: 0.015, trail_fraction: 0.006 },
                TrailTier { min_profit: 0.010, trail_fraction: 0.010 },
            ],
            breakeven_buffer: 0.001,
            partial_take_profit: 0.02,
            partial_take_fraction: 0.5,
            min_stop_change: 0.002,
            default_take_profit: 0.04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionPhase {
    Unprotected,
    Tracking,
    BreakevenApplied,
    PartialTaken,
    Closed,
}

/// Entry details for a freshly filled position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: u64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

/// Per-symbol tracking state owned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: u64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub peak_price: f64,
    pub trailing_stop: Option<f64>,
    pub breakeven_applied: bool,
    pub partial_taken: bool,
    pub last_pushed_stop: Option<f64>,
    /// P&L already banked by a partial exit.
    #[serde(default)]
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn phase(&self) -> PositionPhase {
        if self.partial_taken {
            PositionPhase::PartialTaken
        } else if self.breakeven_applied {
            PositionPhase::BreakevenApplied
        } else if self.stop_loss.is_some() || self.last_pushed_stop.is_some() {
            PositionPhase::Tracking
        } else {
            PositionPhase::Unprotected
        }
    }

    /// Signed return from entry; positive is in the holder's favour.
    pub fn profit_fraction(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    PartialProfit,
    ClosedExternally,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::PartialProfit => "partial_profit",
            ExitReason::ClosedExternally => "closed_externally",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do after a price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickOutcome {
    Hold,
    /// Move the broker-side stop to `stop`, then confirm with `mark_stop_pushed`.
    PushStop { stop: f64 },
    /// Sell `quantity` at market and protect the rest with `stop` / `take_profit`,
    /// then confirm with `confirm_partial`.
    PartialExit {
        quantity: u64,
        remaining: u64,
        stop: f64,
        take_profit: f64,
    },
    /// Close the whole position, then call `close`.
    Exit { reason: ExitReason, price: f64 },
}

/// Realized result of an exit. For a full close, `realized_pnl` includes any
/// earlier partial exit; for a `PartialProfit` slice it covers only the shares sold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u64,
    pub realized_pnl: f64,
    pub pnl_pct: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_secs: i64,
}
