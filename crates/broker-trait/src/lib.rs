use analysis_core::Side;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    /// Equity change since the previous session close.
    pub day_pnl: Decimal,
    /// Same change as a percentage (-3.2 means down 3.2%).
    pub day_pnl_pct: f64,
}

impl BrokerAccount {
    pub fn equity_f64(&self) -> f64 {
        self.equity.to_f64().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute share count.
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pl: Decimal,
    /// Unrealized P&L as a fraction of cost basis.
    pub unrealized_plpc: f64,
}

impl BrokerPosition {
    pub fn avg_entry_price_f64(&self) -> f64 {
        self.avg_entry_price.to_f64().unwrap_or_default()
    }
    pub fn current_price_f64(&self) -> f64 {
        self.current_price.to_f64().unwrap_or_default()
    }
    pub fn unrealized_pl_f64(&self) -> f64 {
        self.unrealized_pl.to_f64().unwrap_or_default()
    }
    /// Whole shares held; fractional remainders are ignored.
    pub fn whole_shares(&self) -> u64 {
        self.qty.trunc().abs().to_u64().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderSide {
    Buy,
    Sell,
}

impl BrokerOrderSide {
    /// Order side that opens a position on `side`.
    pub fn to_open(side: Side) -> Self {
        match side {
            Side::Long => BrokerOrderSide::Buy,
            Side::Short => BrokerOrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position on `side`.
    pub fn to_close(side: Side) -> Self {
        match side {
            Side::Long => BrokerOrderSide::Sell,
            Side::Short => BrokerOrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOrderSide::Buy => "buy",
            BrokerOrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: BrokerOrderSide,
}

impl BrokerOrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Buy,
        }
    }
    pub fn sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Sell,
        }
    }
}

/// Market entry with a server-side stop-loss and take-profit attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: BrokerOrderSide,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

/// One-cancels-other stop + target protecting an existing position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectiveOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub position_side: Side,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    pub qty: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    pub order_type: String,
    pub side: BrokerOrderSide,
    pub status: String,
}

impl BrokerOrder {
    pub fn filled_avg_price_f64(&self) -> Option<f64> {
        self.filled_avg_price.and_then(|p| p.to_f64())
    }
}

/// Convert an analysis price to an order price rounded to cents.
pub fn price_to_decimal(price: f64) -> Option<Decimal> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Decimal::from_f64(price).map(|d| d.round_dp(2))
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Get account information (equity, buying power, day P&L)
    async fn get_account(&self) -> Result<BrokerAccount>;

    /// Get all open positions
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Submit a market order
    async fn place_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder>;

    /// Submit a market entry with attached stop-loss and take-profit legs
    async fn place_bracket_order(&self, order: BracketOrderRequest) -> Result<BrokerOrder>;

    /// Protect an existing position with a stop + target pair
    async fn place_protective_orders(&self, order: ProtectiveOrderRequest) -> Result<BrokerOrder>;

    /// Cancel every open order for a symbol; returns how many were cancelled
    async fn cancel_orders_for_symbol(&self, symbol: &str) -> Result<usize>;

    /// Move the open stop order for a symbol to a new trigger price.
    /// Returns false when the symbol has no open stop order to move.
    async fn replace_stop(&self, symbol: &str, new_stop: Decimal) -> Result<bool>;

    /// Close an entire position at market
    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_for_position_side() {
        assert_eq!(BrokerOrderSide::to_open(Side::Long), BrokerOrderSide::Buy);
        assert_eq!(BrokerOrderSide::to_open(Side::Short), BrokerOrderSide::Sell);
        assert_eq!(BrokerOrderSide::to_close(Side::Long), BrokerOrderSide::Sell);
        assert_eq!(BrokerOrderSide::to_close(Side::Short), BrokerOrderSide::Buy);
    }

    #[test]
    fn test_price_to_decimal_rounds_to_cents() {
        assert_eq!(price_to_decimal(103.688), Some(dec!(103.69)));
        assert_eq!(price_to_decimal(0.0), None);
        assert_eq!(price_to_decimal(f64::NAN), None);
    }

    #[test]
    fn test_whole_shares_ignores_fraction() {
        let position = BrokerPosition {
            symbol: "AAPL".to_string(),
            side: Side::Short,
            qty: dec!(12.7),
            avg_entry_price: dec!(190.10),
            current_price: dec!(188.00),
            unrealized_pl: dec!(26.67),
            unrealized_plpc: 0.011,
        };
        assert_eq!(position.whole_shares(), 12);
        assert!((position.avg_entry_price_f64() - 190.10).abs() < 1e-9);
    }
}
