use crate::models::*;
use analysis_core::{Bar, Side, Timeframe};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use broker_trait::{
    BracketOrderRequest, BrokerAccount, BrokerClient, BrokerOrder, BrokerOrderRequest,
    BrokerOrderSide, BrokerPosition, ProtectiveOrderRequest,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header, Client, Response};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::time::Duration;

const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";
const DATA_BASE_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    data_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaClient {
    /// Create a new Alpaca client
    pub fn new(api_key: String, secret_key: String, base_url: String, data_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
        })
    }

    /// Create client from environment variables.
    /// Accepts both APCA_API_KEY_ID / APCA_API_SECRET_KEY (standard Alpaca names)
    /// and ALPACA_API_KEY / ALPACA_SECRET_KEY.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("APCA_API_KEY_ID")
            .or_else(|_| std::env::var("ALPACA_API_KEY"))
            .map_err(|_| anyhow!("APCA_API_KEY_ID (or ALPACA_API_KEY) not set"))?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")
            .or_else(|_| std::env::var("ALPACA_SECRET_KEY"))
            .map_err(|_| anyhow!("APCA_API_SECRET_KEY (or ALPACA_SECRET_KEY) not set"))?;
        let base_url =
            std::env::var("ALPACA_BASE_URL").unwrap_or_else(|_| PAPER_BASE_URL.to_string());
        let data_url =
            std::env::var("ALPACA_DATA_URL").unwrap_or_else(|_| DATA_BASE_URL.to_string());

        Self::new(api_key, secret_key, base_url, data_url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&self.api_key)
                .context("API key contains invalid header characters")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&self.secret_key)
                .context("Secret key contains invalid header characters")?,
        );
        Ok(headers)
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} ({}): {}", what, status, error_text));
        }
        Ok(response)
    }

    /// Get account information
    pub async fn get_account(&self) -> Result<Account> {
        let url = format!("{}/v2/account", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check(response, "Alpaca API error").await?;
        Ok(response.json::<Account>().await?)
    }

    /// Submit an order
    pub async fn submit_order(&self, order: &OrderRequest) -> Result<Order> {
        let url = format!("{}/v2/orders", self.base_url);

        tracing::info!("Submitting order to Alpaca: {:?}", order);

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(order)
            .send()
            .await?;

        let response = Self::check(response, "Alpaca order failed").await?;
        let order_response = response.json::<Order>().await?;
        tracing::info!("Order submitted successfully: {}", order_response.id);
        Ok(order_response)
    }

    /// Open orders for one symbol, with bracket/OCO legs nested under their parent
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let url = format!(
            "{}/v2/orders?status=open&nested=true&symbols={}",
            self.base_url, symbol
        );

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check(response, "Failed to get orders").await?;
        Ok(response.json::<Vec<Order>>().await?)
    }

    /// Cancel an order
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);

        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        Self::check(response, "Failed to cancel order").await?;
        tracing::info!("Order {} canceled successfully", order_id);
        Ok(())
    }

    /// Move a stop order's trigger price in place
    pub async fn replace_order_stop(&self, order_id: &str, stop_price: Decimal) -> Result<Order> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let body = ReplaceOrderRequest {
            stop_price: stop_price.round_dp(2).to_string(),
        };

        let response = self
            .client
            .patch(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await?;

        let response = Self::check(response, "Failed to replace order").await?;
        Ok(response.json::<Order>().await?)
    }

    /// Get all positions
    pub async fn get_positions(&self) -> Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check(response, "Failed to get positions").await?;
        Ok(response.json::<Vec<Position>>().await?)
    }

    /// Close a position at market
    pub async fn close_position(&self, symbol: &str) -> Result<Order> {
        let url = format!("{}/v2/positions/{}", self.base_url, symbol);

        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check(response, "Failed to close position").await?;
        let order = response.json::<Order>().await?;
        tracing::info!("Position {} closed successfully", symbol);
        Ok(order)
    }

    /// Most recent `limit` bars for a symbol, oldest first.
    pub async fn get_bars(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let start = backfill_start(timeframe, limit, Utc::now());
        let mut bars: Vec<Bar> = Vec::with_capacity(limit);
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/v2/stocks/{}/bars?timeframe={}&start={}&limit=10000&adjustment=raw&feed=iex",
                self.data_url,
                symbol,
                timeframe.as_str(),
                start.format("%Y-%m-%dT%H:%M:%SZ")
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&page_token={}", token));
            }

            let response = self
                .client
                .get(&url)
                .headers(self.auth_headers()?)
                .send()
                .await?;

            let response = Self::check(response, "Failed to get bars").await?;
            let page = response.json::<BarsResponse>().await?;
            bars.extend(page.bars.unwrap_or_default().into_iter().map(AlpacaBar::into_bar));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        if bars.len() > limit {
            let excess = bars.len() - limit;
            bars.drain(..excess);
        }
        tracing::debug!("Fetched {} {} bars for {}", bars.len(), timeframe, symbol);
        Ok(bars)
    }

    /// Check if this client is connected to the paper trading environment
    pub fn is_paper(&self) -> bool {
        self.base_url.contains("paper-api")
    }

    /// Get the base URL (for logging/diagnostics)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// How far back to request so that `limit` bars survive weekends and holidays.
pub fn backfill_start(timeframe: Timeframe, limit: usize, now: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = timeframe.to_minutes();
    let days = if minutes < 60 {
        // 6.5 trading hours per session
        let sessions = (minutes as f64 * limit as f64) / (6.5 * 60.0) + 1.0;
        ((sessions * 1.6) as i64).max(7)
    } else if minutes < 1440 {
        (limit as i64 / 6 + 3).max(7)
    } else {
        limit as i64 * 2
    };
    now - ChronoDuration::days(days)
}

/// Depth-first search for the stop leg among open orders.
pub fn find_stop_order(orders: &[Order]) -> Option<&Order> {
    for order in orders {
        if order.is_stop() {
            return Some(order);
        }
        if let Some(found) = order.legs.as_deref().and_then(find_stop_order) {
            return Some(found);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Conversion helpers: Alpaca types -> unified BrokerClient types
// ---------------------------------------------------------------------------

fn parse_decimal(field: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim()).with_context(|| format!("invalid {} '{}'", field, value))
}

fn parse_f64(field: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid {} '{}'", field, value))
}

fn parse_opt_decimal(field: &str, value: &Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(|v| parse_decimal(field, v)).transpose()
}

pub(crate) fn account_to_broker(a: Account) -> Result<BrokerAccount> {
    let equity = parse_decimal("equity", &a.equity)?;
    let last_equity = parse_decimal("last_equity", &a.last_equity)?;
    let day_pnl = equity - last_equity;
    let day_pnl_pct = if last_equity > Decimal::ZERO {
        (day_pnl / last_equity * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or_default()
    } else {
        0.0
    };

    Ok(BrokerAccount {
        equity,
        cash: parse_decimal("cash", &a.cash)?,
        buying_power: parse_decimal("buying_power", &a.buying_power)?,
        day_pnl,
        day_pnl_pct,
    })
}

pub(crate) fn position_to_broker(p: Position) -> Result<BrokerPosition> {
    let side = match p.side.as_str() {
        "long" => Side::Long,
        "short" => Side::Short,
        other => return Err(anyhow!("unknown position side '{}' for {}", other, p.symbol)),
    };

    Ok(BrokerPosition {
        side,
        qty: parse_decimal("qty", &p.qty)?.abs(),
        avg_entry_price: parse_decimal("avg_entry_price", &p.avg_entry_price)?,
        current_price: parse_decimal("current_price", &p.current_price)?,
        unrealized_pl: parse_decimal("unrealized_pl", &p.unrealized_pl)?,
        unrealized_plpc: parse_f64("unrealized_plpc", &p.unrealized_plpc)?,
        symbol: p.symbol,
    })
}

pub(crate) fn order_to_broker(o: Order) -> Result<BrokerOrder> {
    Ok(BrokerOrder {
        qty: parse_opt_decimal("qty", &o.qty)?,
        filled_qty: parse_opt_decimal("filled_qty", &o.filled_qty)?,
        filled_avg_price: parse_opt_decimal("filled_avg_price", &o.filled_avg_price)?,
        id: o.id,
        client_order_id: o.client_order_id,
        created_at: o.created_at,
        filled_at: o.filled_at,
        symbol: o.symbol,
        order_type: o.order_type,
        side: match o.side {
            OrderSide::Buy => BrokerOrderSide::Buy,
            OrderSide::Sell => BrokerOrderSide::Sell,
        },
        status: o.status,
    })
}

fn to_alpaca_side(side: BrokerOrderSide) -> OrderSide {
    match side {
        BrokerOrderSide::Buy => OrderSide::Buy,
        BrokerOrderSide::Sell => OrderSide::Sell,
    }
}

fn price_string(price: Decimal) -> String {
    price.round_dp(2).to_string()
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    async fn get_account(&self) -> Result<BrokerAccount> {
        account_to_broker(self.get_account().await?)
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.get_positions()
            .await?
            .into_iter()
            .map(position_to_broker)
            .collect()
    }

    async fn place_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::market(order.symbol, order.qty.to_string(), to_alpaca_side(order.side));
        order_to_broker(self.submit_order(&request).await?)
    }

    async fn place_bracket_order(&self, order: BracketOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::bracket(
            order.symbol,
            order.qty.to_string(),
            to_alpaca_side(order.side),
            price_string(order.stop_loss),
            price_string(order.take_profit),
        );
        order_to_broker(self.submit_order(&request).await?)
    }

    async fn place_protective_orders(&self, order: ProtectiveOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::oco(
            order.symbol,
            order.qty.to_string(),
            to_alpaca_side(BrokerOrderSide::to_close(order.position_side)),
            price_string(order.stop_loss),
            price_string(order.take_profit),
        );
        order_to_broker(self.submit_order(&request).await?)
    }

    async fn cancel_orders_for_symbol(&self, symbol: &str) -> Result<usize> {
        let orders = self.get_open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in &orders {
            // Cancelling a parent cancels its legs
            self.cancel_order(&order.id).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn replace_stop(&self, symbol: &str, new_stop: Decimal) -> Result<bool> {
        let orders = self.get_open_orders(symbol).await?;
        let Some(stop) = find_stop_order(&orders) else {
            tracing::warn!("No open stop order for {}", symbol);
            return Ok(false);
        };
        let previous = stop.stop_price.clone().unwrap_or_default();
        self.replace_order_stop(&stop.id, new_stop).await?;
        tracing::info!("{} stop moved ${} -> ${}", symbol, previous, price_string(new_stop));
        Ok(true)
    }

    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder> {
        order_to_broker(self.close_position(symbol).await?)
    }

    fn is_paper(&self) -> bool {
        self.is_paper()
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn order(id: &str, order_type: &str, stop_price: Option<&str>, legs: Option<Vec<Order>>) -> Order {
        Order {
            id: id.to_string(),
            client_order_id: format!("client-{}", id),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
            filled_at: None,
            symbol: "AAPL".to_string(),
            qty: Some("10".to_string()),
            filled_qty: Some("0".to_string()),
            filled_avg_price: None,
            order_type: order_type.to_string(),
            order_class: String::new(),
            side: OrderSide::Sell,
            limit_price: None,
            stop_price: stop_price.map(String::from),
            status: "new".to_string(),
            legs,
        }
    }

    #[test]
    fn test_account_day_pnl() {
        let account = Account {
            id: "acc".to_string(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: "200000".to_string(),
            cash: "50000".to_string(),
            portfolio_value: "96800".to_string(),
            equity: "96800".to_string(),
            last_equity: "100000".to_string(),
            pattern_day_trader: false,
            trading_blocked: false,
            account_blocked: false,
        };
        let broker = account_to_broker(account).unwrap();

        assert_eq!(broker.day_pnl, dec!(-3200));
        assert!((broker.day_pnl_pct - -3.2).abs() < 1e-9);
        assert_eq!(broker.equity, dec!(96800));
    }

    #[test]
    fn test_account_zero_last_equity() {
        let account = Account {
            id: "acc".to_string(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: "0".to_string(),
            cash: "0".to_string(),
            portfolio_value: "0".to_string(),
            equity: "0".to_string(),
            last_equity: "0".to_string(),
            pattern_day_trader: false,
            trading_blocked: false,
            account_blocked: false,
        };
        assert_eq!(account_to_broker(account).unwrap().day_pnl_pct, 0.0);
    }

    #[test]
    fn test_short_position_conversion() {
        let position = Position {
            asset_id: "id".to_string(),
            symbol: "TSLA".to_string(),
            avg_entry_price: "250.00".to_string(),
            qty: "-8".to_string(),
            side: "short".to_string(),
            market_value: "-1960.00".to_string(),
            cost_basis: "-2000.00".to_string(),
            unrealized_pl: "40.00".to_string(),
            unrealized_plpc: "0.02".to_string(),
            current_price: "245.00".to_string(),
        };
        let broker = position_to_broker(position).unwrap();

        assert_eq!(broker.side, Side::Short);
        assert_eq!(broker.qty, dec!(8));
        assert_eq!(broker.whole_shares(), 8);
        assert!((broker.unrealized_plpc - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_bad_decimal_is_error() {
        let mut o = order("x", "market", None, None);
        o.filled_avg_price = Some("n/a".to_string());
        let err = order_to_broker(o).unwrap_err();
        assert!(err.to_string().contains("filled_avg_price"));
    }

    #[test]
    fn test_find_stop_order_in_legs() {
        let orders = vec![
            order("plain", "limit", None, None),
            order(
                "parent",
                "limit",
                None,
                Some(vec![order("leg", "stop", Some("98.00"), None)]),
            ),
        ];
        assert_eq!(find_stop_order(&orders).map(|o| o.id.as_str()), Some("leg"));
        assert!(find_stop_order(&orders[..1]).is_none());
    }

    #[test]
    fn test_backfill_start_covers_weekends() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();

        // 200 x 5Min: 1000 / 390 + 1 = 3.56 sessions -> 5 days, floored to 7
        assert_eq!(backfill_start(Timeframe::Minute5, 200, now), now - ChronoDuration::days(7));
        // 500 x 15Min: 7500 / 390 + 1 = 20.2 sessions -> 32 days
        assert_eq!(backfill_start(Timeframe::Minute15, 500, now), now - ChronoDuration::days(32));
        assert_eq!(backfill_start(Timeframe::Day1, 50, now), now - ChronoDuration::days(100));
    }

    #[tokio::test]
    #[ignore] // Only run with valid credentials
    async fn test_get_account() {
        let client = AlpacaClient::from_env().unwrap();
        let account = BrokerClient::get_account(&client).await.unwrap();

        println!("Equity: ${}", account.equity);
        println!("Day P&L: {:.2}%", account.day_pnl_pct);

        assert!(account.equity >= Decimal::ZERO);
    }

    #[tokio::test]
    #[ignore] // Only run with valid credentials
    async fn test_get_bars() {
        let client = AlpacaClient::from_env().unwrap();
        let bars = client.get_bars("AAPL", Timeframe::Minute5, 50).await.unwrap();

        assert!(bars.len() <= 50);
        assert!(bars.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
