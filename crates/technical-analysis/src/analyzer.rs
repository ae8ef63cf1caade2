use analysis_core::Bar;
use serde::{Deserialize, Serialize};

use crate::indicators::*;
use crate::patterns::*;
use crate::signals::*;
use crate::structure::*;

/// Fewer bars than this produce an empty analysis.
pub const MIN_BARS: usize = 5;

/// Everything computed for one symbol on one bar close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolAnalysis {
    pub symbol: String,
    pub signal: Option<CombinedSignal>,
    /// Patterns on the last two bars only.
    pub patterns: Vec<PatternSignal>,
    pub structure: Option<PriceStructure>,
    pub indicators: IndicatorSummary,
}

impl SymbolAnalysis {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal: None,
            patterns: Vec::new(),
            structure: None,
            indicators: IndicatorSummary::default(),
        }
    }

    /// The combined signal, if it is strong enough to trade on.
    pub fn actionable_signal(&self) -> Option<&CombinedSignal> {
        self.signal.as_ref().filter(|s| s.actionable)
    }
}

/// Runs pattern detection, price structure and indicators, then combines them.
#[derive(Debug, Clone, Default)]
pub struct SignalEngine {
    pub structure: StructureConfig,
    pub indicators: IndicatorConfig,
    pub combiner: CombinerConfig,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(structure: StructureConfig, indicators: IndicatorConfig, combiner: CombinerConfig) -> Self {
        Self {
            structure,
            indicators,
            combiner,
        }
    }

    pub fn analyze(&self, symbol: &str, bars: &[Bar]) -> SymbolAnalysis {
        if bars.len() < MIN_BARS {
            tracing::debug!("{}: {} bars, need {} for analysis", symbol, bars.len(), MIN_BARS);
            return SymbolAnalysis::empty(symbol);
        }

        let last_index = bars.len() - 1;
        let recent: Vec<PatternSignal> = detect_all_patterns(bars)
            .into_iter()
            .filter(|p| p.bar_index + 1 >= last_index)
            .collect();

        let structure = analyze_price_action(bars, &self.structure);
        let indicators = summarize_indicators(bars, &self.indicators);
        let signal = combine_signals(&recent, &structure, &indicators, &self.combiner);

        if let Some(s) = &signal {
            tracing::debug!(
                "{}: {} {} strength={:.3} [{}]",
                symbol,
                s.pattern,
                s.direction,
                s.strength,
                s.confirmations.join(", ")
            );
        }

        SymbolAnalysis {
            symbol: symbol.to_string(),
            signal,
            patterns: recent,
            structure: Some(structure),
            indicators,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::Direction;
    use chrono::{Duration, TimeZone, Utc};

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

    // Filler bars; at most a neutral spinning top fires on these
    fn quiet(n: usize) -> Vec<Bar> {
        (0..n).map(|i| bar(i, 10.00, 10.30, 9.70, 10.20)).collect()
    }

    #[test]
    fn test_too_few_bars_is_empty() {
        let engine = SignalEngine::new();
        let analysis = engine.analyze("AAPL", &quiet(4));
        assert_eq!(analysis.symbol, "AAPL");
        assert!(analysis.signal.is_none());
        assert!(analysis.patterns.is_empty());
        assert!(analysis.structure.is_none());
    }

    #[test]
    fn test_engulfing_on_last_bar_produces_signal() {
        let mut bars = quiet(6);
        bars.push(bar(6, 10.00, 10.20, 7.90, 8.00));
        // Long upper wick keeps the last bar from also reading as a marubozu
        bars.push(bar(7, 7.50, 11.20, 7.40, 10.50));

        let analysis = SignalEngine::new().analyze("MSFT", &bars);
        let signal = analysis.signal.clone().expect("signal");
        assert_eq!(signal.pattern, PatternKind::BullishEngulfing);
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.strength >= 0.8);
        assert!(analysis.actionable_signal().is_some());
        assert!(analysis.patterns.iter().all(|p| p.bar_index >= 6));
    }

    #[test]
    fn test_old_patterns_are_ignored() {
        let mut bars = vec![bar(0, 10.00, 10.20, 7.90, 8.00), bar(1, 7.50, 10.60, 7.40, 10.50)];
        bars.extend((2..8).map(|i| bar(i, 10.00, 10.30, 9.70, 10.20)));

        let analysis = SignalEngine::new().analyze("MSFT", &bars);
        assert!(analysis
            .patterns
            .iter()
            .all(|p| p.name != PatternKind::BullishEngulfing));
    }
}
