//! Average True Range (ATR) indicator
//!
//! Measures market volatility by calculating the average of true ranges over a period.
//! True Range is the greatest of:
//! - Current High - Current Low
//! - Abs(Current High - Previous Close)
//! - Abs(Current Low - Previous Close)
//!
//! Uses Wilder's smoothing once more than `period` true ranges are available.
//! With exactly `period + 1` candles (how daily ATR is fetched for stops)
//! that is the plain mean of the last `period` true ranges.

use crate::models::Candle;

/// True range of every candle after the first
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(candles);

    // First ATR is simple average of first 'period' true ranges
    let first_atr: f64 = ranges.iter().take(period).sum::<f64>() / period as f64;

    let atr = ranges[period..].iter().fold(first_atr, |atr, tr| {
        (atr * (period as f64 - 1.0) + tr) / period as f64
    });

    Some(atr)
}

/// Mean high-low range, used as a cheap volatility baseline
pub fn average_range(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    Some(candles.iter().map(Candle::range).sum::<f64>() / candles.len() as f64)
}
