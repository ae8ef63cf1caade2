use analysis_core::Direction;
use serde::{Deserialize, Serialize};

use crate::indicators::{CrossSignal, IndicatorSummary, RangeSignal};
use crate::patterns::{PatternKind, PatternSignal};
use crate::structure::PriceStructure;

/// How agreeing momentum indicators are credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumPolicy {
    /// RSI, MACD and EMA cross are correlated; count them as one factor.
    Consensus,
    /// Every agreeing indicator earns its own bonus.
    Independent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinerConfig {
    pub trend_bonus: f64,
    pub counter_trend_penalty: f64,
    pub volume_bonus: f64,
    pub momentum_policy: MomentumPolicy,
    pub momentum_consensus_bonus: f64,
    pub momentum_single_bonus: f64,
    pub momentum_independent_bonus: f64,
    pub breakout_bonus: f64,
    pub actionable_threshold: f64,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            trend_bonus: 0.10,
            counter_trend_penalty: 0.15,
            volume_bonus: 0.10,
            momentum_policy: MomentumPolicy::Consensus,
            momentum_consensus_bonus: 0.15,
            momentum_single_bonus: 0.05,
            momentum_independent_bonus: 0.10,
            breakout_bonus: 0.15,
            actionable_threshold: 0.6,
        }
    }
}

/// One scored, directional verdict for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub direction: Direction,
    pub strength: f64,
    pub pattern: PatternKind,
    /// Pattern name first, then every factor that moved the score.
    pub confirmations: Vec<String>,
    pub actionable: bool,
}

/// Momentum indicators agreeing with `direction`, as confirmation tags.
fn momentum_votes(direction: Direction, indicators: &IndicatorSummary) -> Vec<String> {
    let mut votes = Vec::new();

    if let Some(rsi) = &indicators.rsi {
        match (direction, rsi.signal) {
            (Direction::Long, RangeSignal::Oversold) => votes.push("rsi_oversold".to_string()),
            (Direction::Short, RangeSignal::Overbought) => votes.push("rsi_overbought".to_string()),
            _ => {}
        }
    }

    let cross_tag = |prefix: &str, signal: CrossSignal| -> Option<String> {
        match (direction, signal) {
            (Direction::Long, CrossSignal::Bullish) => Some(format!("{}_bullish", prefix)),
            (Direction::Short, CrossSignal::Bearish) => Some(format!("{}_bearish", prefix)),
            _ => None,
        }
    };

    if let Some(tag) = indicators.macd.as_ref().and_then(|m| cross_tag("macd", m.signal)) {
        votes.push(tag);
    }
    if let Some(tag) = indicators.ema_cross.as_ref().and_then(|e| cross_tag("ema", e.signal)) {
        votes.push(tag);
    }

    votes
}

/// Fold patterns, structure and indicators into one signal.
///
/// The strongest pattern sets the direction (first one wins a tie). Returns
/// `None` when there are no patterns or the strongest is neutral.
pub fn combine_signals(
    patterns: &[PatternSignal],
    structure: &PriceStructure,
    indicators: &IndicatorSummary,
    config: &CombinerConfig,
) -> Option<CombinedSignal> {
    let best = patterns.iter().fold(None::<&PatternSignal>, |best, p| match best {
        Some(b) if b.strength >= p.strength => Some(b),
        _ => Some(p),
    })?;

    let direction = best.direction;
    if direction == Direction::Neutral {
        return None;
    }

    let mut strength = best.strength;
    let mut confirmations = vec![best.name.to_string()];

    // Trend alignment
    let trend_direction = structure.trend.classification.direction();
    if trend_direction == direction {
        strength += config.trend_bonus;
        confirmations.push("trend_aligned".to_string());
    } else if trend_direction != Direction::Neutral {
        strength -= config.counter_trend_penalty;
        confirmations.push("counter_trend".to_string());
    }

    if structure.volume.class.is_elevated() {
        strength += config.volume_bonus;
        confirmations.push("volume_confirmed".to_string());
    }

    let votes = momentum_votes(direction, indicators);
    match config.momentum_policy {
        MomentumPolicy::Consensus => {
            if votes.len() >= 2 {
                strength += config.momentum_consensus_bonus;
                confirmations.push("momentum_confirmed".to_string());
                confirmations.extend(votes);
            } else if votes.len() == 1 {
                strength += config.momentum_single_bonus;
                confirmations.extend(votes);
            }
        }
        MomentumPolicy::Independent => {
            strength += config.momentum_independent_bonus * votes.len() as f64;
            confirmations.extend(votes);
        }
    }

    for breakout in structure.breakouts.iter().filter(|b| b.direction == direction) {
        strength += config.breakout_bonus;
        confirmations.push(breakout.kind.to_string());
    }

    let strength = (strength.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;

    Some(CombinedSignal {
        direction,
        strength,
        pattern: best.name,
        confirmations,
        actionable: strength >= config.actionable_threshold,
    })
}
