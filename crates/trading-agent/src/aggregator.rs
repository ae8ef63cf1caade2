use std::collections::HashMap;

use analysis_core::{Bar, Timeframe};
use chrono::{DateTime, Duration, Utc};

/// Rolls the stream's one-minute bars up into the trading timeframe.
///
/// A bucket is emitted when its last minute arrives, or when the first
/// minute of a later bucket shows up (quiet minutes have no bar).
pub struct BarAggregator {
    minutes: i64,
    pending: HashMap<String, Bar>,
}

fn bucket_start(ts: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let span = minutes * 60;
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(span), 0).unwrap_or(ts)
}

impl BarAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            minutes: timeframe.to_minutes(),
            pending: HashMap::new(),
        }
    }

    /// Add a minute bar; returns the timeframe bars it completed, oldest first.
    pub fn push(&mut self, symbol: &str, bar: Bar) -> Vec<Bar> {
        if self.minutes <= 1 {
            return vec![bar];
        }

        let start = bucket_start(bar.timestamp, self.minutes);
        let mut completed = Vec::new();

        if let Some(pending) = self.pending.get(symbol) {
            if start < pending.timestamp {
                tracing::debug!("{}: minute bar {} belongs to a flushed bucket", symbol, bar.timestamp);
                return completed;
            }
            if start > pending.timestamp {
                if let Some(done) = self.pending.remove(symbol) {
                    completed.push(done);
                }
            }
        }

        let last_minute = bar.timestamp + Duration::minutes(1) >= start + Duration::minutes(self.minutes);
        match self.pending.get_mut(symbol) {
            Some(acc) => {
                acc.vwap = match (acc.vwap, bar.vwap) {
                    (Some(a), Some(b)) if acc.volume + bar.volume > 0 => Some(
                        (a * acc.volume as f64 + b * bar.volume as f64) / (acc.volume + bar.volume) as f64,
                    ),
                    _ => None,
                };
                acc.high = acc.high.max(bar.high);
                acc.low = acc.low.min(bar.low);
                acc.close = bar.close;
                acc.volume += bar.volume;
            }
            None => {
                self.pending.insert(
                    symbol.to_string(),
                    Bar {
                        timestamp: start,
                        ..bar
                    },
                );
            }
        }

        if last_minute {
            if let Some(done) = self.pending.remove(symbol) {
                completed.push(done);
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute(m: u32, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 14, m, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
            vwap: Some(close),
        }
    }

    #[test]
    fn test_one_minute_passes_through() {
        let mut agg = BarAggregator::new(Timeframe::Minute1);
        let out = agg.push("AAPL", minute(3, 1.0, 2.0, 0.5, 1.5, 10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp.format("%H:%M").to_string(), "14:03");
    }

    #[test]
    fn test_full_bucket_emits_on_last_minute() {
        let mut agg = BarAggregator::new(Timeframe::Minute5);
        assert!(agg.push("AAPL", minute(0, 10.0, 10.5, 9.9, 10.2, 100)).is_empty());
        assert!(agg.push("AAPL", minute(1, 10.2, 11.0, 10.1, 10.8, 100)).is_empty());
        assert!(agg.push("AAPL", minute(2, 10.8, 10.9, 9.5, 9.7, 100)).is_empty());
        assert!(agg.push("AAPL", minute(3, 9.7, 10.0, 9.6, 9.9, 100)).is_empty());
        let out = agg.push("AAPL", minute(4, 9.9, 10.4, 9.8, 10.3, 100));

        assert_eq!(out.len(), 1);
        let bar = &out[0];
        assert_eq!(bar.timestamp, Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap());
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.high, 11.0);
        assert_eq!(bar.low, 9.5);
        assert_eq!(bar.close, 10.3);
        assert_eq!(bar.volume, 500);
        assert!((bar.vwap.unwrap() - (10.2 + 10.8 + 9.7 + 9.9 + 10.3) / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_flushes_previous_bucket() {
        let mut agg = BarAggregator::new(Timeframe::Minute5);
        agg.push("AAPL", minute(5, 10.0, 10.5, 9.9, 10.2, 100));
        agg.push("AAPL", minute(6, 10.2, 10.6, 10.0, 10.4, 50));

        let out = agg.push("AAPL", minute(11, 10.4, 10.7, 10.3, 10.6, 80));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, Utc.with_ymd_and_hms(2024, 6, 3, 14, 5, 0).unwrap());
        assert_eq!(out[0].volume, 150);
        assert_eq!(out[0].close, 10.4);

        // A straggler for the flushed bucket is dropped
        assert!(agg.push("AAPL", minute(7, 10.0, 10.0, 10.0, 10.0, 1)).is_empty());
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut agg = BarAggregator::new(Timeframe::Minute5);
        agg.push("AAPL", minute(0, 10.0, 10.5, 9.9, 10.2, 100));
        assert!(agg.push("MSFT", minute(1, 400.0, 401.0, 399.0, 400.5, 10)).is_empty());
        let out = agg.push("MSFT", minute(4, 400.5, 402.0, 400.0, 401.0, 10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open, 400.0);
        assert_eq!(out[0].timestamp, Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap());
    }
}
