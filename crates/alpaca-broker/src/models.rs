use analysis_core::Bar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub status: String,
    pub currency: String,
    pub buying_power: String,
    pub cash: String,
    pub portfolio_value: String,
    pub equity: String,
    /// Equity at the previous session close
    pub last_equity: String,
    #[serde(default)]
    pub pattern_day_trader: bool,
    #[serde(default)]
    pub trading_blocked: bool,
    #[serde(default)]
    pub account_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc, // Good til canceled
    Ioc, // Immediate or cancel
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderClass {
    Simple,
    Bracket,
    Oco,
    Oto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    pub limit_price: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossLeg {
    pub stop_price: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_class: Option<OrderClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TakeProfitLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossLeg>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, qty: String, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            order_class: None,
            take_profit: None,
            stop_loss: None,
        }
    }

    /// Market entry with attached stop-loss and take-profit legs.
    pub fn bracket(
        symbol: impl Into<String>,
        qty: String,
        side: OrderSide,
        stop_price: String,
        limit_price: String,
    ) -> Self {
        Self {
            time_in_force: TimeInForce::Gtc,
            order_class: Some(OrderClass::Bracket),
            take_profit: Some(TakeProfitLeg { limit_price }),
            stop_loss: Some(StopLossLeg { stop_price }),
            ..Self::market(symbol, qty, side)
        }
    }

    /// One-cancels-other exit pair for shares already held.
    pub fn oco(
        symbol: impl Into<String>,
        qty: String,
        side: OrderSide,
        stop_price: String,
        limit_price: String,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(limit_price.clone()),
            order_class: Some(OrderClass::Oco),
            take_profit: Some(TakeProfitLeg { limit_price }),
            stop_loss: Some(StopLossLeg { stop_price }),
            ..Self::market(symbol, qty, side)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaceOrderRequest {
    pub stop_price: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    pub qty: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
    pub order_type: String,
    #[serde(default)]
    pub order_class: String,
    pub side: OrderSide,
    pub limit_price: Option<String>,
    pub stop_price: Option<String>,
    pub status: String,
    /// Child orders of a bracket or OCO parent
    #[serde(default)]
    pub legs: Option<Vec<Order>>,
}

impl Order {
    pub fn is_stop(&self) -> bool {
        matches!(self.order_type.as_str(), "stop" | "stop_limit") && self.stop_price.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Position {
    pub asset_id: String,
    pub symbol: String,
    pub avg_entry_price: String,
    /// Negative for short positions
    pub qty: String,
    pub side: String,
    pub market_value: String,
    pub cost_basis: String,
    pub unrealized_pl: String,
    pub unrealized_plpc: String,
    pub current_price: String,
}

/// Historical bar as returned by the market-data REST API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlpacaBar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: u64,
    #[serde(rename = "vw", default)]
    pub vwap: Option<f64>,
}

impl AlpacaBar {
    pub fn into_bar(self) -> Bar {
        Bar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    /// `null` when the range holds no bars
    #[serde(default)]
    pub bars: Option<Vec<AlpacaBar>>,
    pub next_page_token: Option<String>,
}

/// One element of a market-data stream frame. Frames are JSON arrays of these.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "T")]
pub enum StreamMessage {
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "error")]
    Error { code: i64, msg: String },
    #[serde(rename = "b")]
    Bar {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
        #[serde(rename = "o")]
        open: f64,
        #[serde(rename = "h")]
        high: f64,
        #[serde(rename = "l")]
        low: f64,
        #[serde(rename = "c")]
        close: f64,
        #[serde(rename = "v")]
        volume: u64,
        #[serde(rename = "vw", default)]
        vwap: Option<f64>,
    },
    #[serde(other)]
    Other,
}

impl StreamMessage {
    pub fn into_bar(self) -> Option<(String, Bar)> {
        match self {
            StreamMessage::Bar {
                symbol,
                timestamp,
                open,
                high,
                low,
                close,
                volume,
                vwap,
            } => Some((
                symbol,
                Bar {
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    vwap,
                },
            )),
            _ => None,
        }
    }
}
