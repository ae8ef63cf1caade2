use analysis_core::Side;
use risk_manager::ClosedPosition;
use serde::{Deserialize, Serialize};

/// A bracket entry that the broker accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEntry {
    pub trade_id: Option<i64>,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Result of feeding one bar through the strategy.
#[derive(Debug, Clone)]
pub enum BarOutcome {
    /// Out-of-order or malformed bar, dropped before analysis
    Ignored(String),
    NoSignal,
    /// Actionable signal that stopped short of an order
    Skipped(String),
    Entered(TradeEntry),
}

/// What one position sweep did, per symbol.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub evaluated: usize,
    pub stops_pushed: Vec<(String, f64)>,
    pub partial_exits: Vec<(String, u64)>,
    pub closed: Vec<ClosedPosition>,
    pub adopted: Vec<String>,
    /// Entries dropped because the broker never filled them
    pub cancelled: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.stops_pushed.is_empty()
            && self.partial_exits.is_empty()
            && self.closed.is_empty()
            && self.adopted.is_empty()
            && self.cancelled.is_empty()
            && self.errors.is_empty()
    }
}
