use std::sync::Mutex;

use analysis_core::Side;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_trait::*;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::oracle::{Advice, AdvisoryOracle, AdvisoryRequest};
use crate::store::TradeStore;

pub async fn memory_store() -> TradeStore {
    let store = TradeStore::connect("sqlite::memory:").await.unwrap();
    store.init_tables().await.unwrap();
    store
}

pub fn account(equity: f64, day_pnl_pct: f64) -> BrokerAccount {
    let equity = Decimal::from_f64(equity).unwrap();
    BrokerAccount {
        equity,
        cash: equity,
        buying_power: equity,
        day_pnl: Decimal::from_f64(equity.to_f64().unwrap() * day_pnl_pct / 100.0).unwrap_or_default(),
        day_pnl_pct,
    }
}

pub fn position(symbol: &str, side: Side, qty: u64, entry: f64, current: f64) -> BrokerPosition {
    let pl = side.sign() * (current - entry) * qty as f64;
    BrokerPosition {
        symbol: symbol.to_string(),
        side,
        qty: Decimal::from(qty),
        avg_entry_price: Decimal::from_f64(entry).unwrap(),
        current_price: Decimal::from_f64(current).unwrap(),
        unrealized_pl: Decimal::from_f64(pl).unwrap().round_dp(2),
        unrealized_plpc: pl / (entry * qty as f64),
    }
}

#[derive(Default)]
pub struct MockState {
    pub account: Option<BrokerAccount>,
    pub positions: Vec<BrokerPosition>,
    /// One line per mutating call, e.g. "market AAPL sell 50".
    pub calls: Vec<String>,
    pub fill_price: Option<Decimal>,
    pub fail_account: bool,
    pub fail_positions: bool,
    pub fail_replace_stop: bool,
    /// The broker has no stop order left to move.
    pub missing_stop: bool,
    pub fail_market_order: bool,
    pub fail_close: bool,
    next_id: u64,
}

/// In-memory broker that records every order-side call.
#[derive(Default)]
pub struct MockBroker {
    pub state: Mutex<MockState>,
}

impl MockBroker {
    pub fn with_account(equity: f64, day_pnl_pct: f64) -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().account = Some(account(equity, day_pnl_pct));
        broker
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        self.state.lock().unwrap().positions = positions;
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        for p in state.positions.iter_mut().filter(|p| p.symbol == symbol) {
            let entry = p.avg_entry_price.to_f64().unwrap();
            let qty = p.qty.to_f64().unwrap();
            p.current_price = Decimal::from_f64(price).unwrap();
            p.unrealized_pl = Decimal::from_f64(p.side.sign() * (price - entry) * qty).unwrap().round_dp(2);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    fn order(state: &mut MockState, symbol: &str, qty: Decimal, side: BrokerOrderSide, kind: &str) -> BrokerOrder {
        state.next_id += 1;
        BrokerOrder {
            id: format!("order-{}", state.next_id),
            client_order_id: format!("client-{}", state.next_id),
            created_at: Utc::now(),
            filled_at: state.fill_price.map(|_| Utc::now()),
            symbol: symbol.to_string(),
            qty: Some(qty),
            filled_qty: state.fill_price.map(|_| qty),
            filled_avg_price: state.fill_price,
            order_type: kind.to_string(),
            side,
            status: if state.fill_price.is_some() { "filled" } else { "accepted" }.to_string(),
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_account(&self) -> Result<BrokerAccount> {
        let state = self.state.lock().unwrap();
        if state.fail_account {
            return Err(anyhow!("account endpoint unavailable"));
        }
        state.account.clone().ok_or_else(|| anyhow!("no account configured"))
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let state = self.state.lock().unwrap();
        if state.fail_positions {
            return Err(anyhow!("positions endpoint unavailable"));
        }
        Ok(state.positions.clone())
    }

    async fn place_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("market {} {} {}", order.symbol, order.side.as_str(), order.qty));
        if state.fail_market_order {
            return Err(anyhow!("market order rejected"));
        }
        Ok(Self::order(&mut state, &order.symbol, order.qty, order.side, "market"))
    }

    async fn place_bracket_order(&self, order: BracketOrderRequest) -> Result<BrokerOrder> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "bracket {} {} {} stop={} tp={}",
            order.symbol,
            order.side.as_str(),
            order.qty,
            order.stop_loss,
            order.take_profit
        ));
        Ok(Self::order(&mut state, &order.symbol, order.qty, order.side, "market"))
    }

    async fn place_protective_orders(&self, order: ProtectiveOrderRequest) -> Result<BrokerOrder> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "protective {} {} stop={} tp={}",
            order.symbol, order.qty, order.stop_loss, order.take_profit
        ));
        state.missing_stop = false;
        let side = BrokerOrderSide::to_close(order.position_side);
        Ok(Self::order(&mut state, &order.symbol, order.qty, side, "limit"))
    }

    async fn cancel_orders_for_symbol(&self, symbol: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("cancel {}", symbol));
        state.missing_stop = true;
        Ok(1)
    }

    async fn replace_stop(&self, symbol: &str, new_stop: Decimal) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("replace_stop {} {}", symbol, new_stop));
        if state.fail_replace_stop {
            return Err(anyhow!("replace rejected for {}", symbol));
        }
        Ok(!state.missing_stop)
    }

    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("close {}", symbol));
        if state.fail_close {
            return Err(anyhow!("close rejected for {}", symbol));
        }
        let index = state
            .positions
            .iter()
            .position(|p| p.symbol == symbol)
            .ok_or_else(|| anyhow!("position does not exist: {}", symbol))?;
        let closed = state.positions.remove(index);
        Ok(Self::order(
            &mut state,
            symbol,
            closed.qty,
            BrokerOrderSide::to_close(closed.side),
            "market",
        ))
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "mock"
    }
}

/// Oracle that answers every request with the same advice.
pub struct MockOracle {
    pub advice: Advice,
    pub requests: Mutex<Vec<AdvisoryRequest>>,
}

impl MockOracle {
    pub fn new(advice: Advice) -> Self {
        Self {
            advice,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AdvisoryOracle for MockOracle {
    async fn advise(&self, request: &AdvisoryRequest) -> Advice {
        self.requests.lock().unwrap().push(request.clone());
        self.advice.clone()
    }
}
