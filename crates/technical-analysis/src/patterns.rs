use std::collections::BTreeMap;
use std::fmt;

use analysis_core::{AnalysisError, Bar, Direction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Doji,
    DragonflyDoji,
    GravestoneDoji,
    LongLeggedDoji,
    Hammer,
    InvertedHammer,
    ShootingStar,
    BullishMarubozu,
    BearishMarubozu,
    SpinningTop,
    BullishEngulfing,
    BearishEngulfing,
    BullishHarami,
    BearishHarami,
    PiercingLine,
    DarkCloudCover,
    MorningStar,
    EveningStar,
    ThreeWhiteSoldiers,
    ThreeBlackCrows,
}

impl PatternKind {
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::Doji => "doji",
            PatternKind::DragonflyDoji => "dragonfly_doji",
            PatternKind::GravestoneDoji => "gravestone_doji",
            PatternKind::LongLeggedDoji => "long_legged_doji",
            PatternKind::Hammer => "hammer",
            PatternKind::InvertedHammer => "inverted_hammer",
            PatternKind::ShootingStar => "shooting_star",
            PatternKind::BullishMarubozu => "bullish_marubozu",
            PatternKind::BearishMarubozu => "bearish_marubozu",
            PatternKind::SpinningTop => "spinning_top",
            PatternKind::BullishEngulfing => "bullish_engulfing",
            PatternKind::BearishEngulfing => "bearish_engulfing",
            PatternKind::BullishHarami => "bullish_harami",
            PatternKind::BearishHarami => "bearish_harami",
            PatternKind::PiercingLine => "piercing_line",
            PatternKind::DarkCloudCover => "dark_cloud_cover",
            PatternKind::MorningStar => "morning_star",
            PatternKind::EveningStar => "evening_star",
            PatternKind::ThreeWhiteSoldiers => "three_white_soldiers",
            PatternKind::ThreeBlackCrows => "three_black_crows",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A candlestick formation found at `bar_index` of the scanned window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignal {
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub name: PatternKind,
    pub direction: Direction,
    pub strength: f64, // 0.0 to 1.0
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
}

type DetectorFn = fn(&[Bar]) -> Result<Vec<PatternSignal>, AnalysisError>;

/// Every detector, in the order they run.
pub const DETECTORS: &[(&str, DetectorFn)] = &[
    ("doji", detect_doji),
    ("hammer", detect_hammer),
    ("inverted_hammer", detect_inverted_hammer),
    ("shooting_star", detect_shooting_star),
    ("marubozu", detect_marubozu),
    ("spinning_top", detect_spinning_top),
    ("engulfing", detect_engulfing),
    ("harami", detect_harami),
    ("piercing_dark_cloud", detect_piercing_dark_cloud),
    ("morning_evening_star", detect_morning_evening_star),
    ("three_soldiers_crows", detect_three_soldiers_crows),
];

fn checked(bars: &[Bar], i: usize) -> Result<&Bar, AnalysisError> {
    let bar = &bars[i];
    if !bar.is_finite() {
        return Err(AnalysisError::InvalidData(format!(
            "bar {} has non-finite prices",
            i
        )));
    }
    Ok(bar)
}

fn signal(
    bar_index: usize,
    bar: &Bar,
    name: PatternKind,
    direction: Direction,
    strength: f64,
    details: &[(&str, f64)],
) -> PatternSignal {
    PatternSignal {
        bar_index,
        timestamp: bar.timestamp,
        name,
        direction,
        strength,
        details: details
            .iter()
            .map(|(k, v)| (k.to_string(), round4(*v)))
            .collect(),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// ── Single candle ────────────────────────────────────────────

/// Doji family: body under 10% of the range, split by shadow symmetry.
pub fn detect_doji(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 0..bars.len() {
        let bar = checked(bars, i)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }
        let body_ratio = bar.body() / range;
        if body_ratio >= 0.1 {
            continue;
        }

        let upper = bar.upper_shadow();
        let lower = bar.lower_shadow();
        let kind = if upper < range * 0.1 {
            PatternKind::DragonflyDoji
        } else if lower < range * 0.1 {
            PatternKind::GravestoneDoji
        } else if upper > range * 0.3 && lower > range * 0.3 {
            PatternKind::LongLeggedDoji
        } else {
            PatternKind::Doji
        };

        signals.push(signal(
            i,
            bar,
            kind,
            Direction::Neutral,
            0.5,
            &[("body_ratio", body_ratio)],
        ));
    }
    Ok(signals)
}

/// Small body near the top of the range with a long lower shadow, after a lower close.
pub fn detect_hammer(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let bar = checked(bars, i)?;
        let prev = checked(bars, i - 1)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }

        let body = bar.body();
        let lower = bar.lower_shadow();
        let upper = bar.upper_shadow();

        if body < range * 0.35 && lower >= body * 2.0 && upper < body * 0.5 && bar.close < prev.close {
            signals.push(signal(
                i,
                bar,
                PatternKind::Hammer,
                Direction::Long,
                0.7,
                &[("lower_shadow_ratio", lower / range)],
            ));
        }
    }
    Ok(signals)
}

fn is_long_upper_wick(bar: &Bar, range: f64) -> bool {
    let body = bar.body();
    body < range * 0.35 && bar.upper_shadow() >= body * 2.0 && bar.lower_shadow() < body * 0.5
}

pub fn detect_inverted_hammer(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let bar = checked(bars, i)?;
        let prev = checked(bars, i - 1)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }

        if is_long_upper_wick(bar, range) && bar.close < prev.close {
            signals.push(signal(
                i,
                bar,
                PatternKind::InvertedHammer,
                Direction::Long,
                0.6,
                &[("upper_shadow_ratio", bar.upper_shadow() / range)],
            ));
        }
    }
    Ok(signals)
}

/// Same geometry as the inverted hammer, but printed after a higher close.
pub fn detect_shooting_star(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let bar = checked(bars, i)?;
        let prev = checked(bars, i - 1)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }

        if is_long_upper_wick(bar, range) && bar.close > prev.close {
            signals.push(signal(
                i,
                bar,
                PatternKind::ShootingStar,
                Direction::Short,
                0.7,
                &[("upper_shadow_ratio", bar.upper_shadow() / range)],
            ));
        }
    }
    Ok(signals)
}

pub fn detect_marubozu(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 0..bars.len() {
        let bar = checked(bars, i)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }

        let body = bar.body();
        if body > range * 0.85 && bar.upper_shadow() < range * 0.08 && bar.lower_shadow() < range * 0.08 {
            let (kind, direction) = if bar.is_bullish() {
                (PatternKind::BullishMarubozu, Direction::Long)
            } else {
                (PatternKind::BearishMarubozu, Direction::Short)
            };
            signals.push(signal(
                i,
                bar,
                kind,
                direction,
                0.8,
                &[("body_ratio", body / range)],
            ));
        }
    }
    Ok(signals)
}

pub fn detect_spinning_top(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 0..bars.len() {
        let bar = checked(bars, i)?;
        let range = bar.range();
        if range <= 0.0 {
            continue;
        }

        let body = bar.body();
        let body_ratio = body / range;
        if body_ratio > 0.1
            && body_ratio < 0.35
            && bar.upper_shadow() >= body * 0.5
            && bar.lower_shadow() >= body * 0.5
        {
            signals.push(signal(
                i,
                bar,
                PatternKind::SpinningTop,
                Direction::Neutral,
                0.4,
                &[("body_ratio", body_ratio)],
            ));
        }
    }
    Ok(signals)
}

// ── Double candle ────────────────────────────────────────────

pub fn detect_engulfing(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let prev = checked(bars, i - 1)?;
        let curr = checked(bars, i)?;

        let body_ratio = if prev.body() > 0.0 {
            curr.body() / prev.body()
        } else {
            999.0
        };

        // Bullish: bearish candle swallowed by a larger bullish candle
        if prev.is_bearish()
            && curr.is_bullish()
            && curr.open <= prev.close
            && curr.close >= prev.open
            && curr.body() > prev.body()
        {
            signals.push(signal(
                i,
                curr,
                PatternKind::BullishEngulfing,
                Direction::Long,
                0.8,
                &[("body_ratio", body_ratio)],
            ));
        }

        // Bearish: bullish candle swallowed by a larger bearish candle
        if prev.is_bullish()
            && curr.is_bearish()
            && curr.open >= prev.close
            && curr.close <= prev.open
            && curr.body() > prev.body()
        {
            signals.push(signal(
                i,
                curr,
                PatternKind::BearishEngulfing,
                Direction::Short,
                0.8,
                &[("body_ratio", body_ratio)],
            ));
        }
    }
    Ok(signals)
}

pub fn detect_harami(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let prev = checked(bars, i - 1)?;
        let curr = checked(bars, i)?;

        let inside = curr.body_high() < prev.body_high() && curr.body_low() > prev.body_low();
        if !inside || curr.body() > prev.body() * 0.6 {
            continue;
        }

        if prev.is_bearish() && curr.is_bullish() {
            signals.push(signal(i, curr, PatternKind::BullishHarami, Direction::Long, 0.65, &[]));
        } else if prev.is_bullish() && curr.is_bearish() {
            signals.push(signal(i, curr, PatternKind::BearishHarami, Direction::Short, 0.65, &[]));
        }
    }
    Ok(signals)
}

/// Piercing line (bullish) and dark cloud cover (bearish).
pub fn detect_piercing_dark_cloud(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 1..bars.len() {
        let prev = checked(bars, i - 1)?;
        let curr = checked(bars, i)?;
        let prev_mid = prev.body_midpoint();

        if prev.is_bearish()
            && curr.is_bullish()
            && curr.open < prev.close
            && curr.close > prev_mid
            && curr.close < prev.open
        {
            signals.push(signal(i, curr, PatternKind::PiercingLine, Direction::Long, 0.7, &[]));
        }

        if prev.is_bullish()
            && curr.is_bearish()
            && curr.open > prev.close
            && curr.close < prev_mid
            && curr.close > prev.open
        {
            signals.push(signal(i, curr, PatternKind::DarkCloudCover, Direction::Short, 0.7, &[]));
        }
    }
    Ok(signals)
}

// ── Triple candle ────────────────────────────────────────────

pub fn detect_morning_evening_star(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 2..bars.len() {
        let first = checked(bars, i - 2)?;
        let second = checked(bars, i - 1)?;
        let third = checked(bars, i)?;

        let first_body = first.body();
        let second_body = second.body();
        let third_body = third.body();

        // Middle candle must be small relative to the first
        if first_body <= 0.0 || second_body > first_body * 0.5 || third_body <= second_body {
            continue;
        }

        let first_mid = first.body_midpoint();
        let star_ratio = second_body / first_body;

        if first.is_bearish() && third.is_bullish() && third.close > first_mid {
            signals.push(signal(
                i,
                third,
                PatternKind::MorningStar,
                Direction::Long,
                0.85,
                &[("star_ratio", star_ratio)],
            ));
        }

        if first.is_bullish() && third.is_bearish() && third.close < first_mid {
            signals.push(signal(
                i,
                third,
                PatternKind::EveningStar,
                Direction::Short,
                0.85,
                &[("star_ratio", star_ratio)],
            ));
        }
    }
    Ok(signals)
}

fn is_full_bodied(bar: &Bar) -> bool {
    bar.body() > bar.range() * 0.5
}

pub fn detect_three_soldiers_crows(bars: &[Bar]) -> Result<Vec<PatternSignal>, AnalysisError> {
    let mut signals = Vec::new();
    for i in 2..bars.len() {
        let c1 = checked(bars, i - 2)?;
        let c2 = checked(bars, i - 1)?;
        let c3 = checked(bars, i)?;

        let strong = is_full_bodied(c1) && is_full_bodied(c2) && is_full_bodied(c3);
        if !strong {
            continue;
        }

        if c1.is_bullish()
            && c2.is_bullish()
            && c3.is_bullish()
            && c2.close > c1.close
            && c3.close > c2.close
            && c2.open > c1.open
            && c3.open > c2.open
        {
            signals.push(signal(i, c3, PatternKind::ThreeWhiteSoldiers, Direction::Long, 0.9, &[]));
        }

        if c1.is_bearish()
            && c2.is_bearish()
            && c3.is_bearish()
            && c2.close < c1.close
            && c3.close < c2.close
            && c2.open < c1.open
            && c3.open < c2.open
        {
            signals.push(signal(i, c3, PatternKind::ThreeBlackCrows, Direction::Short, 0.9, &[]));
        }
    }
    Ok(signals)
}

/// Detect all patterns in a set of bars, sorted by bar index (most recent last).
///
/// A detector that fails is logged and skipped; the others still run.
pub fn detect_all_patterns(bars: &[Bar]) -> Vec<PatternSignal> {
    let mut patterns = Vec::new();

    for (name, detector) in DETECTORS {
        match detector(bars) {
            Ok(found) => patterns.extend(found),
            Err(e) => tracing::debug!("Pattern detector {} skipped: {}", name, e),
        }
    }

    patterns.sort_by_key(|p| p.bar_index);
    patterns
}
