use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use analysis_core::{Bar, Timeframe};
use broker_trait::{price_to_decimal, BracketOrderRequest, BrokerClient, BrokerOrderSide};
use chrono::Utc;
use risk_manager::{NewPosition, RiskGate};
use rust_decimal::Decimal;
use technical_analysis::{SignalEngine, SymbolAnalysis};
use tokio::sync::Mutex;

use crate::oracle::{AdvisoryOracle, AdvisoryRequest};
use crate::position_manager::PositionManager;
use crate::store::{NewSignal, NewTrade, TradeStore};
use crate::types::{BarOutcome, TradeEntry};

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub timeframe: Timeframe,
    pub history_bars: usize,
    pub min_history_bars: usize,
    pub min_ai_confidence: f64,
}

/// Bar-close pipeline: window, analyze, advise, gate, size, enter.
pub struct Strategy {
    engine: SignalEngine,
    broker: Arc<dyn BrokerClient>,
    oracle: Arc<dyn AdvisoryOracle>,
    gate: Arc<Mutex<RiskGate>>,
    positions: Arc<PositionManager>,
    store: TradeStore,
    config: StrategyConfig,
    windows: HashMap<String, VecDeque<Bar>>,
}

impl Strategy {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        oracle: Arc<dyn AdvisoryOracle>,
        gate: Arc<Mutex<RiskGate>>,
        positions: Arc<PositionManager>,
        store: TradeStore,
        config: StrategyConfig,
    ) -> Self {
        Self {
            engine: SignalEngine::new(),
            broker,
            oracle,
            gate,
            positions,
            store,
            config,
            windows: HashMap::new(),
        }
    }

    /// Load history without analysing it. Bars are sorted and trimmed to the window size.
    pub fn seed(&mut self, symbol: &str, mut bars: Vec<Bar>) {
        bars.retain(Bar::is_finite);
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        let skip = bars.len().saturating_sub(self.config.history_bars);
        let window: VecDeque<Bar> = bars.into_iter().skip(skip).collect();
        tracing::info!("Seeded {} with {} bars", symbol, window.len());
        self.windows.insert(symbol.to_string(), window);
    }

    pub fn window_len(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map(VecDeque::len).unwrap_or(0)
    }

    /// Feed one closed bar. Never fails: every problem becomes a logged outcome.
    pub async fn on_bar(&mut self, symbol: &str, bar: Bar) -> BarOutcome {
        if !bar.is_finite() {
            tracing::warn!("Dropping non-finite bar for {}", symbol);
            return BarOutcome::Ignored("non-finite bar".to_string());
        }

        let window = self.windows.entry(symbol.to_string()).or_default();
        match window.back().map(|last| last.timestamp) {
            Some(last) if bar.timestamp < last => {
                tracing::warn!("Dropping out-of-order bar for {}: {} < {}", symbol, bar.timestamp, last);
                return BarOutcome::Ignored("out-of-order bar".to_string());
            }
            Some(last) if bar.timestamp == last => {
                window.pop_back();
            }
            _ => {}
        }
        window.push_back(bar.clone());
        while window.len() > self.config.history_bars {
            window.pop_front();
        }
        let len = window.len();

        if let Err(e) = self.store.upsert_candle(symbol, self.config.timeframe, &bar).await {
            tracing::warn!("Failed to store candle for {}: {:#}", symbol, e);
        }

        if len < self.config.min_history_bars {
            tracing::debug!("{}: {} bars, waiting for {}", symbol, len, self.config.min_history_bars);
            return BarOutcome::NoSignal;
        }

        let bars: Vec<Bar> = self.windows.get(symbol).map(|w| w.iter().cloned().collect()).unwrap_or_default();
        let analysis = self.engine.analyze(symbol, &bars);
        if analysis.actionable_signal().is_none() {
            return BarOutcome::NoSignal;
        }

        self.consider_entry(symbol, &bar, analysis, bars.len()).await
    }

    async fn consider_entry(&self, symbol: &str, bar: &Bar, analysis: SymbolAnalysis, bar_count: usize) -> BarOutcome {
        let (Some(signal), Some(structure)) = (analysis.signal, analysis.structure) else {
            return BarOutcome::NoSignal;
        };
        let price = bar.close;

        tracing::info!(
            "Signal: {} {} {} strength={:.2} [{}]",
            symbol,
            signal.direction,
            signal.pattern,
            signal.strength,
            signal.confirmations.join(", ")
        );

        let signal_id = match self
            .store
            .insert_signal(&NewSignal {
                symbol: symbol.to_string(),
                timeframe: self.config.timeframe,
                timestamp: bar.timestamp,
                name: signal.pattern.name().to_string(),
                direction: signal.direction.as_str().to_string(),
                strength: signal.strength,
                details: serde_json::json!({
                    "confirmations": signal.confirmations,
                    "trend": structure.trend,
                    "volume": structure.volume,
                }),
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to store signal for {}: {:#}", symbol, e);
                None
            }
        };

        if self.positions.is_tracked(symbol).await {
            return skip(symbol, format!("already holding {}", symbol));
        }

        let check = self.gate.lock().await.check_can_trade(self.broker.as_ref()).await;
        if !check.can_trade {
            return skip(symbol, check.reason);
        }

        let request = AdvisoryRequest {
            symbol: symbol.to_string(),
            current_price: price,
            signal: signal.clone(),
            structure,
            indicators: analysis.indicators,
            context: Some(format!(
                "Timeframe: {}. Bars analysed: {}.",
                self.config.timeframe, bar_count
            )),
        };
        let advice = self.oracle.advise(&request).await;

        let Some(side) = advice.decision.side() else {
            return skip(symbol, format!("advisor skipped: {}", advice.reasoning));
        };
        if advice.confidence < self.config.min_ai_confidence {
            return skip(
                symbol,
                format!(
                    "advisor confidence {:.2} below {:.2}",
                    advice.confidence, self.config.min_ai_confidence
                ),
            );
        }
        if signal.direction.side() != Some(side) {
            return skip(
                symbol,
                format!("advisor wants {} against a {} signal", side, signal.direction),
            );
        }

        let (size, stops) = {
            let gate = self.gate.lock().await;
            let size = gate.calculate_position_size(self.broker.as_ref(), price).await;
            let stops = gate.calculate_stops(price, side, advice.stop_loss, advice.take_profit);
            (size, stops)
        };
        if size.quantity == 0 {
            return skip(symbol, size.reason);
        }

        let (Some(stop_loss), Some(take_profit)) =
            (price_to_decimal(stops.stop_loss), price_to_decimal(stops.take_profit))
        else {
            return skip(symbol, format!("unusable levels {:?}", stops));
        };

        let order = match self
            .broker
            .place_bracket_order(BracketOrderRequest {
                symbol: symbol.to_string(),
                qty: Decimal::from(size.quantity),
                side: BrokerOrderSide::to_open(side),
                stop_loss,
                take_profit,
            })
            .await
        {
            Ok(order) => order,
            Err(e) => {
                tracing::error!("Bracket order for {} failed: {:#}", symbol, e);
                return BarOutcome::Skipped(format!("order failed: {}", e));
            }
        };

        let entry_price = order.filled_avg_price_f64().unwrap_or(price);
        let opened_at = Utc::now();
        tracing::info!(
            "ENTERED {} {} x{} @ ${:.2} (stop ${:.2}, target ${:.2}, order {})",
            side,
            symbol,
            size.quantity,
            entry_price,
            stops.stop_loss,
            stops.take_profit,
            order.id
        );

        let trade_id = match self
            .store
            .insert_trade(&NewTrade {
                order_id: order.id.clone(),
                symbol: symbol.to_string(),
                side,
                quantity: size.quantity,
                entry_price,
                stop_loss: stops.stop_loss,
                take_profit: stops.take_profit,
                signal_id,
                ai_reasoning: Some(advice.reasoning.clone()).filter(|r| !r.is_empty()),
                opened_at,
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to store trade for {}: {:#}", symbol, e);
                None
            }
        };

        if let Err(e) = self
            .positions
            .track(NewPosition {
                symbol: symbol.to_string(),
                side,
                entry_price,
                quantity: size.quantity,
                stop_loss: Some(stops.stop_loss),
                take_profit: Some(stops.take_profit),
                opened_at,
            })
            .await
        {
            // The next sweep adopts it from the broker
            tracing::error!("Could not track {}: {:#}", symbol, e);
        }

        BarOutcome::Entered(TradeEntry {
            trade_id,
            order_id: order.id,
            symbol: symbol.to_string(),
            side,
            quantity: size.quantity,
            entry_price,
            stop_loss: stops.stop_loss,
            take_profit: stops.take_profit,
        })
    }
}

fn skip(symbol: &str, reason: String) -> BarOutcome {
    tracing::info!("Skipping {}: {}", symbol, reason);
    BarOutcome::Skipped(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Advice, Decision};
    use crate::test_support::*;
    use analysis_core::Side;
    use chrono::{Duration, TimeZone};
    use risk_manager::{RiskParameters, TrailingConfig};

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap() + Duration::minutes(5 * i as i64),
            open,
            high,
            low,
            close,
            volume: 20_000,
            vwap: None,
        }
    }

    /// Six quiet bars and the bearish bar; the next bar completes a bullish engulfing.
    fn history() -> Vec<Bar> {
        let mut bars: Vec<Bar> = (0..6).map(|i| bar(i, 10.00, 10.30, 9.70, 10.20)).collect();
        bars.push(bar(6, 10.00, 10.20, 7.90, 8.00));
        bars
    }

    fn engulfing() -> Bar {
        bar(7, 7.50, 11.20, 7.40, 10.50)
    }

    fn enter_long(confidence: f64) -> Advice {
        Advice {
            decision: Decision::EnterLong,
            confidence,
            stop_loss: None,
            take_profit: None,
            reasoning: "engulfing off the lows".to_string(),
            key_factors: vec![],
        }
    }

    struct Harness {
        strategy: Strategy,
        broker: Arc<MockBroker>,
        oracle: Arc<MockOracle>,
        positions: Arc<PositionManager>,
        store: TradeStore,
    }

    async fn harness(broker: MockBroker, advice: Advice) -> Harness {
        let broker = Arc::new(broker);
        let oracle = Arc::new(MockOracle::new(advice));
        let store = memory_store().await;
        let positions = Arc::new(PositionManager::new(broker.clone(), store.clone(), TrailingConfig::default()));
        let strategy = Strategy::new(
            broker.clone(),
            oracle.clone(),
            Arc::new(Mutex::new(RiskGate::new(RiskParameters::default()))),
            positions.clone(),
            store.clone(),
            StrategyConfig {
                timeframe: Timeframe::Minute5,
                history_bars: 100,
                min_history_bars: 5,
                min_ai_confidence: 0.6,
            },
        );
        Harness {
            strategy,
            broker,
            oracle,
            positions,
            store,
        }
    }

    #[tokio::test]
    async fn test_engulfing_enters_long_bracket() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), enter_long(0.8)).await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        let BarOutcome::Entered(entry) = outcome else {
            panic!("expected entry, got {:?}", outcome);
        };
        assert_eq!(entry.side, Side::Long);
        assert_eq!(entry.quantity, 476);
        assert!((entry.stop_loss - 10.29).abs() < 1e-9);
        assert!((entry.take_profit - 10.92).abs() < 1e-9);
        assert!(entry.trade_id.is_some());
        assert_eq!(h.broker.calls(), vec!["bracket AAPL buy 476 stop=10.29 tp=10.92"]);

        let request = h.oracle.requests.lock().unwrap()[0].clone();
        assert_eq!(request.symbol, "AAPL");
        assert!((request.current_price - 10.50).abs() < 1e-12);

        assert!(h.positions.is_tracked("AAPL").await);
        let trade = h.store.open_trade("AAPL").await.unwrap().unwrap();
        assert_eq!(trade.quantity, 476);
        assert_eq!(trade.stop_loss, Some(10.29));
    }

    #[tokio::test]
    async fn test_advisor_levels_used_when_valid() {
        let advice = Advice {
            stop_loss: Some(9.80),
            take_profit: Some(11.60),
            ..enter_long(0.9)
        };
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), advice).await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        let BarOutcome::Entered(entry) = outcome else {
            panic!("expected entry");
        };
        assert!((entry.stop_loss - 9.80).abs() < 1e-9);
        assert!((entry.take_profit - 11.60).abs() < 1e-9);
        assert_eq!(h.broker.calls_starting("bracket AAPL buy 476 ").len(), 1);
    }

    #[tokio::test]
    async fn test_advisor_skip_places_nothing() {
        let mut h = harness(
            MockBroker::with_account(100_000.0, 0.0),
            Advice::skip("trend exhausted"),
        )
        .await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        let BarOutcome::Skipped(reason) = outcome else {
            panic!("expected skip");
        };
        assert!(reason.contains("trend exhausted"));
        assert!(h.broker.calls().is_empty());
        assert!(!h.positions.is_tracked("AAPL").await);
    }

    #[tokio::test]
    async fn test_low_confidence_skipped() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), enter_long(0.55)).await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        assert!(matches!(outcome, BarOutcome::Skipped(ref r) if r.contains("confidence")));
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_advisor_against_signal_skipped() {
        let advice = Advice {
            decision: Decision::EnterShort,
            ..enter_long(0.9)
        };
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), advice).await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        assert!(matches!(outcome, BarOutcome::Skipped(_)));
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_daily_loss_halts_before_advisor() {
        let mut h = harness(MockBroker::with_account(100_000.0, -3.2), enter_long(0.9)).await;
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        assert!(matches!(outcome, BarOutcome::Skipped(ref r) if r.contains("Daily loss limit")));
        assert_eq!(h.oracle.request_count(), 0);
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_already_tracked_symbol_skipped() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), enter_long(0.9)).await;
        h.positions
            .track(NewPosition {
                symbol: "AAPL".to_string(),
                side: Side::Long,
                entry_price: 10.0,
                quantity: 10,
                stop_loss: Some(9.8),
                take_profit: Some(10.4),
                opened_at: Utc::now(),
            })
            .await
            .unwrap();
        h.strategy.seed("AAPL", history());

        let outcome = h.strategy.on_bar("AAPL", engulfing()).await;

        assert!(matches!(outcome, BarOutcome::Skipped(ref r) if r.contains("already holding")));
        assert_eq!(h.oracle.request_count(), 0);
    }

    #[tokio::test]
    async fn test_short_history_is_no_signal() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), enter_long(0.9)).await;

        for i in 0..4 {
            let outcome = h.strategy.on_bar("AAPL", bar(i, 10.00, 10.30, 9.70, 10.20)).await;
            assert!(matches!(outcome, BarOutcome::NoSignal));
        }
        assert_eq!(h.strategy.window_len("AAPL"), 4);
        let stored = h.store.recent_candles("AAPL", Timeframe::Minute5, 10).await.unwrap();
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn test_out_of_order_dropped_and_same_timestamp_replaces() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), enter_long(0.9)).await;
        h.strategy.seed("AAPL", history());
        assert_eq!(h.strategy.window_len("AAPL"), 7);

        let outcome = h.strategy.on_bar("AAPL", bar(3, 10.00, 10.30, 9.70, 10.20)).await;
        assert!(matches!(outcome, BarOutcome::Ignored(_)));
        assert_eq!(h.strategy.window_len("AAPL"), 7);

        // A corrected version of the last bar replaces it in place
        h.strategy.on_bar("AAPL", bar(6, 10.00, 10.20, 7.90, 8.10)).await;
        assert_eq!(h.strategy.window_len("AAPL"), 7);
    }

    #[tokio::test]
    async fn test_window_capped_at_history_size() {
        let mut h = harness(MockBroker::with_account(100_000.0, 0.0), Advice::skip("no")).await;
        h.strategy.config.history_bars = 6;
        h.strategy.seed("AAPL", history());
        assert_eq!(h.strategy.window_len("AAPL"), 6);

        h.strategy.on_bar("AAPL", bar(7, 10.00, 10.30, 9.70, 10.20)).await;
        assert_eq!(h.strategy.window_len("AAPL"), 6);
    }
}
