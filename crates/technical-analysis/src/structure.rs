//! Price structure: swing-based support/resistance, trend from higher/lower
//! highs and lows, level breakouts, and relative volume.

use std::fmt;

use analysis_core::{Bar, Direction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureConfig {
    pub swing_window: usize,
    pub level_tolerance: f64,
    pub trend_lookback: usize,
    pub volume_lookback: usize,
    pub breakout_volume_multiplier: f64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            swing_window: 20,
            level_tolerance: 0.005,
            trend_lookback: 20,
            volume_lookback: 20,
            breakout_volume_multiplier: 1.5,
        }
    }
}

/// Bars averaged for breakout volume confirmation.
const BREAKOUT_VOLUME_BARS: usize = 20;

/// A cluster of swing points. `price` keeps full precision; comparisons use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub touches: usize,
}

impl PriceLevel {
    pub fn display_price(&self) -> f64 {
        (self.price * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendClass {
    Uptrend,
    Downtrend,
    Sideways,
}

impl TrendClass {
    /// Direction a trend favours; sideways favours none.
    pub fn direction(&self) -> Direction {
        match self {
            TrendClass::Uptrend => Direction::Long,
            TrendClass::Downtrend => Direction::Short,
            TrendClass::Sideways => Direction::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReading {
    pub classification: TrendClass,
    pub strength: f64,
    pub higher_highs: usize,
    pub higher_lows: usize,
    pub lower_highs: usize,
    pub lower_lows: usize,
}

impl TrendReading {
    fn sideways() -> Self {
        Self {
            classification: TrendClass::Sideways,
            strength: 0.0,
            higher_highs: 0,
            higher_lows: 0,
            lower_highs: 0,
            lower_lows: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakoutKind {
    BreakoutAboveResistance,
    BreakdownBelowSupport,
}

impl BreakoutKind {
    pub fn name(&self) -> &'static str {
        match self {
            BreakoutKind::BreakoutAboveResistance => "breakout_above_resistance",
            BreakoutKind::BreakdownBelowSupport => "breakdown_below_support",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            BreakoutKind::BreakoutAboveResistance => Direction::Long,
            BreakoutKind::BreakdownBelowSupport => Direction::Short,
        }
    }
}

impl fmt::Display for BreakoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakout {
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub kind: BreakoutKind,
    pub direction: Direction,
    pub strength: f64,
    pub level: f64,
    pub volume_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeClass {
    VeryHigh,
    High,
    Normal,
    Low,
    NoVolume,
}

impl VolumeClass {
    pub fn is_elevated(&self) -> bool {
        matches!(self, VolumeClass::VeryHigh | VolumeClass::High)
    }
}

/// Volume of the last bar against the look-back average.
/// `current` and `average` are 0 when history is shorter than the look-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeReading {
    pub relative: f64,
    pub class: VolumeClass,
    pub current: u64,
    pub average: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceStructure {
    pub trend: TrendReading,
    pub support: Vec<PriceLevel>,
    pub resistance: Vec<PriceLevel>,
    pub breakouts: Vec<Breakout>,
    pub volume: VolumeReading,
}

/// Swing highs and lows: a bar whose high (low) is the extreme of the
/// `window/2` bars on each side.
pub fn find_swings(bars: &[Bar], window: usize) -> (Vec<f64>, Vec<f64>) {
    let half = window / 2;
    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();

    if bars.len() <= 2 * half {
        return (swing_highs, swing_lows);
    }

    for i in half..bars.len() - half {
        let neighbourhood = &bars[i - half..=i + half];
        let max_high = neighbourhood.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let min_low = neighbourhood.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

        if bars[i].high == max_high {
            swing_highs.push(bars[i].high);
        }
        if bars[i].low == min_low {
            swing_lows.push(bars[i].low);
        }
    }

    (swing_highs, swing_lows)
}

/// Group nearby prices; only clusters touched at least twice become levels.
pub fn cluster_levels(prices: &[f64], tolerance: f64) -> Vec<PriceLevel> {
    let mut sorted: Vec<f64> = prices.iter().copied().filter(|p| p.is_finite()).collect();
    if sorted.is_empty() {
        return vec![];
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut levels = Vec::new();
    let mut sum = sorted[0];
    let mut count = 1usize;

    for &price in &sorted[1..] {
        let mean = sum / count as f64;
        if mean != 0.0 && (price - mean).abs() / mean < tolerance {
            sum += price;
            count += 1;
        } else {
            if count >= 2 {
                levels.push(PriceLevel { price: sum / count as f64, touches: count });
            }
            sum = price;
            count = 1;
        }
    }
    if count >= 2 {
        levels.push(PriceLevel { price: sum / count as f64, touches: count });
    }

    levels
}

/// Support and resistance levels from clustered swing points.
pub fn find_support_resistance(bars: &[Bar], config: &StructureConfig) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    let (highs, lows) = find_swings(bars, config.swing_window);
    (
        cluster_levels(&lows, config.level_tolerance),
        cluster_levels(&highs, config.level_tolerance),
    )
}

pub fn detect_trend(bars: &[Bar], lookback: usize) -> TrendReading {
    if lookback < 2 || bars.len() < lookback {
        return TrendReading::sideways();
    }

    let recent = &bars[bars.len() - lookback..];
    let mut reading = TrendReading::sideways();

    for pair in recent.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        if curr.high > prev.high {
            reading.higher_highs += 1;
        }
        if curr.high < prev.high {
            reading.lower_highs += 1;
        }
        if curr.low > prev.low {
            reading.higher_lows += 1;
        }
        if curr.low < prev.low {
            reading.lower_lows += 1;
        }
    }

    let total = 2.0 * (lookback - 1) as f64;
    let up_score = (reading.higher_highs + reading.higher_lows) as f64 / total;
    let down_score = (reading.lower_highs + reading.lower_lows) as f64 / total;

    let (classification, strength) = if up_score > 0.6 {
        (TrendClass::Uptrend, up_score.min(1.0))
    } else if down_score > 0.6 {
        (TrendClass::Downtrend, down_score.min(1.0))
    } else {
        (TrendClass::Sideways, 1.0 - (up_score - down_score).abs())
    };

    reading.classification = classification;
    reading.strength = (strength * 1000.0).round() / 1000.0;
    reading
}

/// Closes crossing a level between the last two bars.
pub fn detect_breakouts(
    bars: &[Bar],
    support: &[PriceLevel],
    resistance: &[PriceLevel],
    volume_multiplier: f64,
) -> Vec<Breakout> {
    if bars.len() < 2 {
        return vec![];
    }

    let index = bars.len() - 1;
    let curr = &bars[index];
    let prev = &bars[index - 1];

    let recent = &bars[bars.len().saturating_sub(BREAKOUT_VOLUME_BARS)..];
    let avg_volume = recent.iter().map(|b| b.volume as f64).sum::<f64>() / recent.len() as f64;
    let volume_confirmed = curr.volume as f64 > avg_volume * volume_multiplier;
    let strength = if volume_confirmed { 0.8 } else { 0.5 };

    let breakout = |kind: BreakoutKind, level: f64| Breakout {
        bar_index: index,
        timestamp: curr.timestamp,
        kind,
        direction: kind.direction(),
        strength,
        level,
        volume_confirmed,
    };

    let mut breakouts = Vec::new();
    for level in resistance {
        if prev.close < level.price && curr.close > level.price {
            breakouts.push(breakout(BreakoutKind::BreakoutAboveResistance, level.price));
        }
    }
    for level in support {
        if prev.close > level.price && curr.close < level.price {
            breakouts.push(breakout(BreakoutKind::BreakdownBelowSupport, level.price));
        }
    }
    breakouts
}

pub fn analyze_volume(bars: &[Bar], lookback: usize) -> VolumeReading {
    if lookback == 0 || bars.len() < lookback {
        return VolumeReading {
            relative: 1.0,
            class: VolumeClass::Normal,
            current: 0,
            average: 0,
        };
    }

    let recent = &bars[bars.len() - lookback..];
    let average = recent.iter().map(|b| b.volume as f64).sum::<f64>() / lookback as f64;
    let current = bars[bars.len() - 1].volume;

    if average == 0.0 {
        return VolumeReading {
            relative: 0.0,
            class: VolumeClass::NoVolume,
            current,
            average: 0,
        };
    }

    let relative = current as f64 / average;
    let class = if relative > 2.0 {
        VolumeClass::VeryHigh
    } else if relative > 1.5 {
        VolumeClass::High
    } else if relative > 0.7 {
        VolumeClass::Normal
    } else {
        VolumeClass::Low
    };

    VolumeReading {
        relative: (relative * 100.0).round() / 100.0,
        class,
        current,
        average: average as u64,
    }
}

pub fn analyze_price_action(bars: &[Bar], config: &StructureConfig) -> PriceStructure {
    let (support, resistance) = find_support_resistance(bars, config);
    let breakouts = detect_breakouts(bars, &support, &resistance, config.breakout_volume_multiplier);

    PriceStructure {
        trend: detect_trend(bars, config.trend_lookback),
        support,
        resistance,
        breakouts,
        volume: analyze_volume(bars, config.volume_lookback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 6, 13, 30, 0).unwrap() + Duration::minutes(i as i64),
            open,
            high,
            low,
            close,
            volume,
            vwap: None,
        }
    }

    fn rising(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(i, base, base + 1.0, base - 1.0, base + 0.5, 10_000)
            })
            .collect()
    }

    #[test]
    fn test_cluster_levels_keeps_repeated_touches() {
        let levels = cluster_levels(&[100.0, 100.2, 105.0, 110.0, 110.3, 110.1], 0.005);
        assert_eq!(levels.len(), 2);
        assert!((levels[0].price - 100.1).abs() < 1e-9);
        assert_eq!(levels[0].touches, 2);
        assert_eq!(levels[1].touches, 3);
        assert!((levels[1].display_price() - 110.13).abs() < 1e-9);
    }

    #[test]
    fn test_cluster_levels_empty() {
        assert!(cluster_levels(&[], 0.005).is_empty());
        assert!(cluster_levels(&[101.0], 0.005).is_empty());
    }

    #[test]
    fn test_find_swings_small_window() {
        let bars = vec![
            bar(0, 10.0, 10.5, 9.5, 10.0, 100),
            bar(1, 10.0, 11.0, 9.8, 10.5, 100),
            bar(2, 10.5, 12.0, 10.0, 11.5, 100),
            bar(3, 11.0, 11.2, 9.0, 10.0, 100),
            bar(4, 10.0, 10.8, 9.6, 10.2, 100),
        ];
        let (highs, lows) = find_swings(&bars, 2);
        assert_eq!(highs, vec![12.0]);
        assert_eq!(lows, vec![9.0]);
    }

    #[test]
    fn test_find_swings_short_history() {
        let (highs, lows) = find_swings(&rising(5), 20);
        assert!(highs.is_empty());
        assert!(lows.is_empty());
    }

    #[test]
    fn test_uptrend_detection() {
        let trend = detect_trend(&rising(25), 20);
        assert_eq!(trend.classification, TrendClass::Uptrend);
        assert!((trend.strength - 1.0).abs() < 1e-9);
        assert_eq!(trend.higher_highs, 19);
        assert_eq!(trend.higher_lows, 19);
    }

    #[test]
    fn test_downtrend_detection() {
        let mut bars = rising(20);
        bars.reverse();
        let trend = detect_trend(&bars, 20);
        assert_eq!(trend.classification, TrendClass::Downtrend);
        assert_eq!(trend.lower_lows, 19);
    }

    #[test]
    fn test_flat_is_sideways_with_full_strength() {
        let bars: Vec<Bar> = (0..20).map(|i| bar(i, 10.0, 10.5, 9.5, 10.0, 100)).collect();
        let trend = detect_trend(&bars, 20);
        assert_eq!(trend.classification, TrendClass::Sideways);
        assert!((trend.strength - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_history_trend() {
        let trend = detect_trend(&rising(5), 20);
        assert_eq!(trend.classification, TrendClass::Sideways);
        assert_eq!(trend.strength, 0.0);
    }

    #[test]
    fn test_breakout_above_resistance_with_volume() {
        let mut bars: Vec<Bar> = (0..10).map(|i| bar(i, 99.0, 99.5, 98.5, 99.0, 1_000)).collect();
        bars.push(bar(10, 99.0, 101.5, 98.9, 101.0, 5_000));
        let resistance = vec![PriceLevel { price: 100.004, touches: 2 }];

        let found = detect_breakouts(&bars, &[], &resistance, 1.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, BreakoutKind::BreakoutAboveResistance);
        assert_eq!(found[0].direction, Direction::Long);
        assert!(found[0].volume_confirmed);
        assert!((found[0].strength - 0.8).abs() < 1e-12);
        assert_eq!(found[0].bar_index, 10);
    }

    #[test]
    fn test_breakdown_below_support_without_volume() {
        let bars = vec![
            bar(0, 50.2, 50.4, 50.0, 50.3, 1_000),
            bar(1, 50.3, 50.3, 49.5, 49.6, 1_000),
        ];
        let support = vec![PriceLevel { price: 50.0, touches: 3 }];
        let found = detect_breakouts(&bars, &support, &[], 1.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, BreakoutKind::BreakdownBelowSupport);
        assert!(!found[0].volume_confirmed);
        assert!((found[0].strength - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_breakout_uses_full_precision_level() {
        // Rounded level would be 100.00 and count as crossed; the real level is not
        let bars = vec![
            bar(0, 99.9, 100.0, 99.8, 99.99, 1_000),
            bar(1, 99.99, 100.01, 99.95, 100.002, 1_000),
        ];
        let resistance = vec![PriceLevel { price: 100.004, touches: 2 }];
        assert!(detect_breakouts(&bars, &[], &resistance, 1.5).is_empty());
    }

    #[test]
    fn test_volume_classes() {
        let mut bars: Vec<Bar> = (0..19).map(|i| bar(i, 10.0, 10.5, 9.5, 10.0, 1_000)).collect();
        bars.push(bar(19, 10.0, 10.5, 9.5, 10.0, 4_000));
        let reading = analyze_volume(&bars, 20);
        // average 1150, relative 3.48
        assert_eq!(reading.class, VolumeClass::VeryHigh);
        assert_eq!(reading.current, 4_000);
        assert_eq!(reading.average, 1_150);

        bars[19].volume = 500;
        assert_eq!(analyze_volume(&bars, 20).class, VolumeClass::Low);

        bars[19].volume = 1_000;
        assert_eq!(analyze_volume(&bars, 20).class, VolumeClass::Normal);
    }

    #[test]
    fn test_volume_edge_cases() {
        let short = analyze_volume(&rising(5), 20);
        assert_eq!(short.class, VolumeClass::Normal);
        assert!((short.relative - 1.0).abs() < 1e-12);

        let silent: Vec<Bar> = (0..20).map(|i| bar(i, 10.0, 10.5, 9.5, 10.0, 0)).collect();
        let reading = analyze_volume(&silent, 20);
        assert_eq!(reading.class, VolumeClass::NoVolume);
        assert_eq!(reading.relative, 0.0);
    }

    #[test]
    fn test_analyze_price_action_on_rising_series() {
        let structure = analyze_price_action(&rising(30), &StructureConfig::default());
        assert_eq!(structure.trend.classification, TrendClass::Uptrend);
        // Strictly rising series has no interior swing extremes
        assert!(structure.support.is_empty());
        assert!(structure.resistance.is_empty());
        assert!(structure.breakouts.is_empty());
        assert_eq!(structure.volume.class, VolumeClass::Normal);
    }
}
