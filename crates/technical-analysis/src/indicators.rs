use analysis_core::Bar;
use serde::{Deserialize, Serialize};

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let sum: f64 = data[i + 1 - period..=i].iter().sum();
        result.push(sum / period as f64);
    }
    result
}

/// Exponential Moving Average, seeded with the SMA of the first `period` values.
///
/// Output is aligned to the end of the input: `result.last()` belongs to
/// `data.last()`, and `result.len() == data.len() - period + 1`.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len() - period + 1);

    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    result.push(seed);

    for value in &data[period..] {
        let prev = result[result.len() - 1];
        result.push((value - prev) * multiplier + prev);
    }

    result
}

/// Relative Strength Index (Wilder smoothing)
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period + 1 {
        return vec![];
    }

    let mut gains = Vec::with_capacity(data.len() - 1);
    let mut losses = Vec::with_capacity(data.len() - 1);

    for i in 1..data.len() {
        let change = data[i] - data[i - 1];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(change.abs());
        }
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    let mut rsi_values = Vec::with_capacity(data.len() - period);
    rsi_values.push(rsi_from_averages(avg_gain, avg_loss));

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
        rsi_values.push(rsi_from_averages(avg_gain, avg_loss));
    }

    rsi_values
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// MACD (Moving Average Convergence Divergence)
pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(data: &[f64], fast_period: usize, slow_period: usize, signal_period: usize) -> MacdResult {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || slow_period < fast_period {
        return MacdResult { macd_line: vec![], signal_line: vec![], histogram: vec![] };
    }

    let ema_fast = ema(data, fast_period);
    let ema_slow = ema(data, slow_period);

    // Both series end on the last input; the fast one starts earlier
    let offset = slow_period - fast_period;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow)| ema_fast[i + offset] - slow)
        .collect();

    let signal_line = ema(&macd_line, signal_period);

    let hist_offset = macd_line.len().saturating_sub(signal_line.len());
    let histogram = signal_line
        .iter()
        .enumerate()
        .map(|(i, signal)| macd_line[i + hist_offset] - signal)
        .collect();

    MacdResult {
        macd_line,
        signal_line,
        histogram,
    }
}

/// Bollinger Bands
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    if period == 0 || data.len() < period {
        return BollingerBands { upper: vec![], middle: vec![], lower: vec![] };
    }

    let middle = sma(data, period);
    let mut upper = Vec::with_capacity(middle.len());
    let mut lower = Vec::with_capacity(middle.len());

    for i in period - 1..data.len() {
        let slice = &data[i + 1 - period..=i];
        let mean = middle[i + 1 - period];
        // Population variance
        let variance: f64 = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
        let std = variance.sqrt();

        upper.push(mean + std_dev * std);
        lower.push(mean - std_dev * std);
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// Volume-Weighted Average Price, cumulative from the first bar.
///
/// `None` until some volume has traded.
pub fn vwap(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut vwap_values = Vec::with_capacity(bars.len());
    let mut cumulative_tpv = 0.0;
    let mut cumulative_volume = 0.0;

    for bar in bars {
        let volume = bar.volume as f64;
        cumulative_tpv += bar.typical_price() * volume;
        cumulative_volume += volume;

        vwap_values.push(if cumulative_volume > 0.0 {
            Some(cumulative_tpv / cumulative_volume)
        } else {
            None
        });
    }

    vwap_values
}

// ── Summary ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            ema_fast: 9,
            ema_slow: 20,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSignal {
    Overbought,
    Oversold,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossSignal {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VwapSignal {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiReading {
    pub value: f64,
    pub signal: RangeSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdReading {
    pub value: f64,
    pub signal_line: f64,
    pub histogram: f64,
    pub signal: CrossSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaCrossReading {
    pub fast: f64,
    pub slow: f64,
    pub signal: CrossSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BollingerReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub signal: RangeSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VwapReading {
    pub value: f64,
    pub signal: VwapSignal,
}

/// Latest reading of each indicator. A field is `None` when history is too short.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSummary {
    pub rsi: Option<RsiReading>,
    pub macd: Option<MacdReading>,
    pub ema_cross: Option<EmaCrossReading>,
    pub bollinger: Option<BollingerReading>,
    pub vwap: Option<VwapReading>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn summarize_indicators(bars: &[Bar], config: &IndicatorConfig) -> IndicatorSummary {
    let mut summary = IndicatorSummary::default();
    let Some(last) = bars.last() else {
        return summary;
    };
    let price = last.close;
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    if let Some(&value) = rsi(&closes, config.rsi_period).last() {
        let signal = if value > config.rsi_overbought {
            RangeSignal::Overbought
        } else if value < config.rsi_oversold {
            RangeSignal::Oversold
        } else {
            RangeSignal::Neutral
        };
        summary.rsi = Some(RsiReading {
            value: round2(value),
            signal,
        });
    }

    let m = macd(&closes, config.macd_fast, config.macd_slow, config.macd_signal);
    if let (Some(&line), Some(&signal_line), Some(&histogram)) =
        (m.macd_line.last(), m.signal_line.last(), m.histogram.last())
    {
        summary.macd = Some(MacdReading {
            value: round4(line),
            signal_line: round4(signal_line),
            histogram: round4(histogram),
            signal: if line > signal_line {
                CrossSignal::Bullish
            } else {
                CrossSignal::Bearish
            },
        });
    }

    if let (Some(&fast), Some(&slow)) = (
        ema(&closes, config.ema_fast).last(),
        ema(&closes, config.ema_slow).last(),
    ) {
        summary.ema_cross = Some(EmaCrossReading {
            fast: round2(fast),
            slow: round2(slow),
            signal: if fast > slow {
                CrossSignal::Bullish
            } else {
                CrossSignal::Bearish
            },
        });
    }

    let bands = bollinger_bands(&closes, config.bollinger_period, config.bollinger_std_dev);
    if let (Some(&upper), Some(&middle), Some(&lower)) =
        (bands.upper.last(), bands.middle.last(), bands.lower.last())
    {
        let signal = if price > upper {
            RangeSignal::Overbought
        } else if price < lower {
            RangeSignal::Oversold
        } else {
            RangeSignal::Neutral
        };
        summary.bollinger = Some(BollingerReading {
            upper: round2(upper),
            middle: round2(middle),
            lower: round2(lower),
            signal,
        });
    }

    if let Some(Some(value)) = vwap(bars).last().copied() {
        summary.vwap = Some(VwapReading {
            value: round2(value),
            signal: if price > value {
                VwapSignal::Above
            } else {
                VwapSignal::Below
            },
        });
    }

    summary
}
