use analysis_core::{Bar, Side, Timeframe};
use anyhow::{anyhow, Context, Result};
use broker_trait::{BrokerAccount, BrokerPosition};
use chrono::{DateTime, SecondsFormat, Utc};
use risk_manager::{ClosedPosition, Position, PositionPhase};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

/// Candles, signals, trades, live positions and account snapshots on SQLite.
///
/// A trade row moves `pending` (order accepted) to `filled` (broker holds the
/// position) to `closed`, or from `pending` to `cancelled` when the entry never fills.
///
/// Timestamps are stored as second-precision RFC 3339 UTC strings so that
/// text ordering is chronological.
#[derive(Clone)]
pub struct TradeStore {
    pool: AnyPool,
}

#[derive(Debug, Clone)]
pub struct NewSignal {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub direction: String,
    pub strength: f64,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub signal_id: Option<i64>,
    pub ai_reasoning: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// An open trade row, used to restore levels for positions found at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrade {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn phase_label(phase: PositionPhase) -> &'static str {
    match phase {
        PositionPhase::Unprotected => "unprotected",
        PositionPhase::Tracking => "tracking",
        PositionPhase::BreakevenApplied => "breakeven_applied",
        PositionPhase::PartialTaken => "partial_taken",
        PositionPhase::Closed => "closed",
    }
}

fn parse_side(raw: &str) -> Result<Side> {
    match raw {
        "long" => Ok(Side::Long),
        "short" => Ok(Side::Short),
        other => Err(anyhow!("unknown side '{}'", other)),
    }
}

impl TradeStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        // Every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {}", database_url))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                vwap REAL,
                UNIQUE(symbol, timeframe, timestamp)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                name TEXT NOT NULL,
                direction TEXT NOT NULL,
                strength REAL NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                signal_id INTEGER,
                ai_reasoning TEXT,
                opened_at TEXT NOT NULL,
                filled_at TEXT,
                partial_qty INTEGER,
                partial_exit_price REAL,
                partial_pnl REAL,
                partial_at TEXT,
                exit_price REAL,
                exit_reason TEXT,
                pnl REAL,
                pnl_pct REAL,
                closed_at TEXT,
                duration_sec INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL NOT NULL,
                unrealized_pl REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                trailing_stop REAL,
                phase TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS account_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                equity REAL NOT NULL,
                cash REAL NOT NULL,
                buying_power REAL NOT NULL,
                day_pnl REAL NOT NULL,
                day_pnl_pct REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol_status ON trades(symbol, status)")
            .execute(&self.pool)
            .await
            .ok();

        Ok(())
    }

    /// Insert a candle, or overwrite it when the same bar arrives again.
    pub async fn upsert_candle(&self, symbol: &str, timeframe: Timeframe, bar: &Bar) -> Result<()> {
        sqlx::query(
            "INSERT INTO candles (symbol, timeframe, timestamp, open, high, low, close, volume, vwap)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol, timeframe, timestamp) DO UPDATE SET
                open = excluded.open, high = excluded.high, low = excluded.low,
                close = excluded.close, volume = excluded.volume, vwap = excluded.vwap",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(ts(bar.timestamp))
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(i64::try_from(bar.volume).unwrap_or(i64::MAX))
        .bind(bar.vwap)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The latest `limit` candles, oldest first.
    pub async fn recent_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            "SELECT timestamp, open, high, low, close, volume, vwap FROM candles
             WHERE symbol = ? AND timeframe = ?
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = rows
            .iter()
            .map(|row| -> Result<Bar> {
                let timestamp: String = row.try_get("timestamp")?;
                let volume: i64 = row.try_get("volume")?;
                Ok(Bar {
                    timestamp: parse_ts(&timestamp)?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: volume.max(0) as u64,
                    vwap: row.try_get("vwap")?,
                })
            })
            .collect::<Result<Vec<Bar>>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub async fn insert_signal(&self, signal: &NewSignal) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO signals (symbol, timeframe, timestamp, signal_type, name, direction, strength, details, created_at)
             VALUES (?, ?, ?, 'combined', ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&signal.symbol)
        .bind(signal.timeframe.as_str())
        .bind(ts(signal.timestamp))
        .bind(&signal.name)
        .bind(&signal.direction)
        .bind(signal.strength)
        .bind(signal.details.to_string())
        .bind(ts(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Record an accepted entry order as a `pending` trade.
    pub async fn insert_trade(&self, trade: &NewTrade) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO trades (order_id, symbol, side, quantity, entry_price, stop_loss, take_profit, status, signal_id, ai_reasoning, opened_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
             RETURNING id",
        )
        .bind(&trade.order_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.quantity as i64)
        .bind(trade.entry_price)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.signal_id)
        .bind(trade.ai_reasoning.as_deref())
        .bind(ts(trade.opened_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Most recent pending or filled trade for a symbol.
    pub async fn open_trade(&self, symbol: &str) -> Result<Option<OpenTrade>> {
        let row = sqlx::query(
            "SELECT id, symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at
             FROM trades WHERE symbol = ? AND status IN ('pending', 'filled')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let side: String = row.try_get("side")?;
        let quantity: i64 = row.try_get("quantity")?;
        let opened_at: String = row.try_get("opened_at")?;
        Ok(Some(OpenTrade {
            id: row.try_get("id")?,
            symbol: row.try_get("symbol")?,
            side: parse_side(&side)?,
            quantity: quantity.max(0) as u64,
            entry_price: row.try_get("entry_price")?,
            stop_loss: row.try_get("stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            opened_at: parse_ts(&opened_at)?,
        }))
    }

    /// The broker now holds the position for this symbol's pending trade.
    pub async fn mark_trade_filled(&self, symbol: &str, filled_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET status = 'filled', filled_at = ?
             WHERE id = (SELECT id FROM trades WHERE symbol = ? AND status = 'pending' ORDER BY id DESC LIMIT 1)",
        )
        .bind(ts(filled_at))
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// The entry order for this symbol's pending trade never filled.
    pub async fn cancel_trade(&self, symbol: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET status = 'cancelled'
             WHERE id = (SELECT id FROM trades WHERE symbol = ? AND status = 'pending' ORDER BY id DESC LIMIT 1)",
        )
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Shrink the open trade to `remaining` shares and keep the sold slice's result.
    pub async fn record_partial_exit(&self, slice: &ClosedPosition, remaining: u64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET quantity = ?, partial_qty = ?, partial_exit_price = ?, partial_pnl = ?, partial_at = ?
             WHERE id = (SELECT id FROM trades WHERE symbol = ? AND status IN ('pending', 'filled') ORDER BY id DESC LIMIT 1)",
        )
        .bind(remaining as i64)
        .bind(slice.quantity as i64)
        .bind(slice.exit_price)
        .bind(slice.realized_pnl)
        .bind(ts(slice.closed_at))
        .bind(&slice.symbol)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark the open trade for the closed position's symbol as closed.
    /// Returns the number of rows updated (0 when the trade was never recorded).
    pub async fn close_trade(&self, closed: &ClosedPosition) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET status = 'closed', exit_price = ?, exit_reason = ?, pnl = ?, pnl_pct = ?,
                closed_at = ?, duration_sec = ?
             WHERE id = (SELECT id FROM trades WHERE symbol = ? AND status IN ('pending', 'filled') ORDER BY id DESC LIMIT 1)",
        )
        .bind(closed.exit_price)
        .bind(closed.reason.as_str())
        .bind(closed.realized_pnl)
        .bind(closed.pnl_pct)
        .bind(ts(closed.closed_at))
        .bind(closed.duration_secs)
        .bind(&closed.symbol)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mirror a held position and its current risk levels.
    pub async fn upsert_position(&self, held: &BrokerPosition, tracked: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions (symbol, side, quantity, entry_price, current_price, unrealized_pl,
                stop_loss, take_profit, trailing_stop, phase, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET
                side = excluded.side, quantity = excluded.quantity, entry_price = excluded.entry_price,
                current_price = excluded.current_price, unrealized_pl = excluded.unrealized_pl,
                stop_loss = excluded.stop_loss, take_profit = excluded.take_profit,
                trailing_stop = excluded.trailing_stop, phase = excluded.phase, updated_at = excluded.updated_at",
        )
        .bind(&held.symbol)
        .bind(tracked.side.as_str())
        .bind(tracked.quantity as i64)
        .bind(tracked.entry_price)
        .bind(held.current_price_f64())
        .bind(held.unrealized_pl_f64())
        .bind(tracked.last_pushed_stop.or(tracked.stop_loss))
        .bind(tracked.take_profit)
        .bind(tracked.trailing_stop)
        .bind(phase_label(tracked.phase()))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_position(&self, symbol: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM positions WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_account_snapshot(&self, account: &BrokerAccount, open_positions: usize) -> Result<()> {
        use rust_decimal::prelude::ToPrimitive;

        sqlx::query(
            "INSERT INTO account_snapshots (equity, cash, buying_power, day_pnl, day_pnl_pct, open_positions, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account.equity.to_f64().unwrap_or_default())
        .bind(account.cash.to_f64().unwrap_or_default())
        .bind(account.buying_power.to_f64().unwrap_or_default())
        .bind(account.day_pnl.to_f64().unwrap_or_default())
        .bind(account.day_pnl_pct)
        .bind(open_positions as i64)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use risk_manager::ExitReason;
    use rust_decimal_macros::dec;

    async fn setup_test_store() -> TradeStore {
        let store = TradeStore::connect("sqlite::memory:").await.unwrap();
        store.init_tables().await.unwrap();
        store
    }

    fn bar(minute: i64, close: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap() + Duration::minutes(minute),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_500,
            vwap: Some(close - 0.1),
        }
    }

    fn new_trade(symbol: &str, order_id: &str) -> NewTrade {
        NewTrade {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity: 10,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            signal_id: None,
            ai_reasoning: Some("engulfing at support".to_string()),
            opened_at: Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_upsert_candle_is_idempotent() {
        let store = setup_test_store().await;

        store.upsert_candle("AAPL", Timeframe::Minute5, &bar(0, 10.0)).await.unwrap();
        store.upsert_candle("AAPL", Timeframe::Minute5, &bar(0, 11.0)).await.unwrap();

        let bars = store.recent_candles("AAPL", Timeframe::Minute5, 10).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert!((bars[0].close - 11.0).abs() < 1e-12);
        assert!((bars[0].vwap.unwrap() - 10.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recent_candles_oldest_first_and_limited() {
        let store = setup_test_store().await;
        for m in 0..8 {
            store
                .upsert_candle("MSFT", Timeframe::Minute5, &bar(m * 5, 100.0 + m as f64))
                .await
                .unwrap();
        }
        store.upsert_candle("MSFT", Timeframe::Minute15, &bar(0, 1.0)).await.unwrap();

        let bars = store.recent_candles("MSFT", Timeframe::Minute5, 3).await.unwrap();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![105.0, 106.0, 107.0]);
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_insert_signal_returns_id() {
        let store = setup_test_store().await;
        let signal = NewSignal {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::Minute5,
            timestamp: Utc::now(),
            name: "bullish_engulfing".to_string(),
            direction: "long".to_string(),
            strength: 0.9,
            details: serde_json::json!({"confirmations": ["trend_aligned"]}),
        };

        let first = store.insert_signal(&signal).await.unwrap();
        let second = store.insert_signal(&signal).await.unwrap();
        assert!(first > 0);
        assert!(second > first);
    }

    fn closed(symbol: &str, quantity: u64, realized_pnl: f64, reason: ExitReason, opened_at: DateTime<Utc>) -> ClosedPosition {
        ClosedPosition {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 103.6,
            quantity,
            realized_pnl,
            pnl_pct: 3.6,
            reason,
            opened_at,
            closed_at: opened_at + Duration::minutes(42),
            duration_secs: 42 * 60,
        }
    }

    async fn trade_status(store: &TradeStore, id: i64) -> String {
        let row = sqlx::query("SELECT status FROM trades WHERE id = ?")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        row.try_get("status").unwrap()
    }

    #[tokio::test]
    async fn test_trade_lifecycle() {
        let store = setup_test_store().await;
        let id = store.insert_trade(&new_trade("AAPL", "ord-1")).await.unwrap();
        assert!(id > 0);
        assert_eq!(trade_status(&store, id).await, "pending");

        let open = store.open_trade("AAPL").await.unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.side, Side::Long);
        assert_eq!(open.stop_loss, Some(98.0));

        assert_eq!(store.mark_trade_filled("AAPL", open.opened_at).await.unwrap(), 1);
        assert_eq!(store.mark_trade_filled("AAPL", open.opened_at).await.unwrap(), 0);
        assert_eq!(trade_status(&store, id).await, "filled");

        let slice = closed("AAPL", 5, 20.0, ExitReason::PartialProfit, open.opened_at);
        assert_eq!(store.record_partial_exit(&slice, 5).await.unwrap(), 1);
        assert_eq!(store.open_trade("AAPL").await.unwrap().unwrap().quantity, 5);

        let full = closed("AAPL", 5, 38.0, ExitReason::TrailingStop, open.opened_at);
        assert_eq!(store.close_trade(&full).await.unwrap(), 1);
        assert!(store.open_trade("AAPL").await.unwrap().is_none());

        let row = sqlx::query("SELECT status, pnl, partial_qty, partial_pnl, exit_reason FROM trades WHERE id = ?")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.try_get("status").unwrap();
        let pnl: f64 = row.try_get("pnl").unwrap();
        let partial_qty: i64 = row.try_get("partial_qty").unwrap();
        let partial_pnl: f64 = row.try_get("partial_pnl").unwrap();
        let reason: String = row.try_get("exit_reason").unwrap();
        assert_eq!(status, "closed");
        assert!((pnl - 38.0).abs() < 1e-9);
        assert_eq!(partial_qty, 5);
        assert!((partial_pnl - 20.0).abs() < 1e-9);
        assert_eq!(reason, "trailing_stop");

        // Nothing left to close
        assert_eq!(store.close_trade(&full).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unfilled_entry_is_cancelled() {
        let store = setup_test_store().await;
        let id = store.insert_trade(&new_trade("TSLA", "ord-2")).await.unwrap();

        assert_eq!(store.cancel_trade("TSLA").await.unwrap(), 1);
        assert_eq!(trade_status(&store, id).await, "cancelled");
        assert!(store.open_trade("TSLA").await.unwrap().is_none());

        // A filled trade is never cancelled
        let second = store.insert_trade(&new_trade("TSLA", "ord-3")).await.unwrap();
        store.mark_trade_filled("TSLA", Utc::now()).await.unwrap();
        assert_eq!(store.cancel_trade("TSLA").await.unwrap(), 0);
        assert_eq!(trade_status(&store, second).await, "filled");
    }

    #[tokio::test]
    async fn test_position_upsert_and_delete() {
        let store = setup_test_store().await;
        let mut held = BrokerPosition {
            symbol: "AAPL".to_string(),
            side: Side::Long,
            qty: dec!(10),
            avg_entry_price: dec!(100),
            current_price: dec!(101),
            unrealized_pl: dec!(10),
            unrealized_plpc: 0.01,
        };
        let mut tracked = Position {
            symbol: "AAPL".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 10,
            stop_loss: Some(98.0),
            take_profit: Some(104.0),
            peak_price: 101.0,
            trailing_stop: None,
            breakeven_applied: false,
            partial_taken: false,
            last_pushed_stop: None,
            realized_pnl: 0.0,
            opened_at: Utc::now(),
        };
        store.upsert_position(&held, &tracked).await.unwrap();

        held.current_price = dec!(103);
        tracked.trailing_stop = Some(102.382);
        tracked.last_pushed_stop = Some(102.382);
        tracked.breakeven_applied = true;
        store.upsert_position(&held, &tracked).await.unwrap();

        let rows = sqlx::query("SELECT symbol, current_price, stop_loss, phase FROM positions")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let current: f64 = rows[0].try_get("current_price").unwrap();
        let stop: f64 = rows[0].try_get("stop_loss").unwrap();
        let phase: String = rows[0].try_get("phase").unwrap();
        assert!((current - 103.0).abs() < 1e-9);
        assert!((stop - 102.382).abs() < 1e-9);
        assert_eq!(phase, "breakeven_applied");

        assert_eq!(store.delete_position("AAPL").await.unwrap(), 1);
        assert_eq!(store.delete_position("AAPL").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_account_snapshot() {
        let store = setup_test_store().await;
        let account = BrokerAccount {
            equity: dec!(96800),
            cash: dec!(50000),
            buying_power: dec!(100000),
            day_pnl: dec!(-3200),
            day_pnl_pct: -3.2,
        };
        store.insert_account_snapshot(&account, 2).await.unwrap();

        let row = sqlx::query("SELECT equity, open_positions FROM account_snapshots")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let equity: f64 = row.try_get("equity").unwrap();
        let positions: i64 = row.try_get("open_positions").unwrap();
        assert!((equity - 96800.0).abs() < 1e-9);
        assert_eq!(positions, 2);
    }
}
