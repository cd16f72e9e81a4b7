//! Technical indicators over daily bars.
//!
//! All functions take bars oldest first and return `None` when there is
//! not enough history to compute a meaningful value.

use crate::types::{PriceBar, TrendBias};

/// Trading days per year, for annualising daily volatility.
const TRADING_DAYS: f64 = 252.0;

/// Average True Range over the last `period` bars.
///
/// Needs `period + 1` bars so every true range has a previous close.
pub fn atr(bars: &[PriceBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let start = bars.len() - period;
    let sum: f64 = (start..bars.len())
        .map(|i| true_range(&bars[i], bars[i - 1].close))
        .sum();
    Some(sum / period as f64)
}

fn true_range(bar: &PriceBar, prev_close: f64) -> f64 {
    let high_low = bar.high - bar.low;
    let high_close = (bar.high - prev_close).abs();
    let low_close = (bar.low - prev_close).abs();
    high_low.max(high_close).max(low_close)
}

/// Mean volume of the last `period` bars (fewer if history is short).
pub fn average_volume(bars: &[PriceBar], period: usize) -> Option<f64> {
    if period == 0 || bars.is_empty() {
        return None;
    }
    let recent = &bars[bars.len().saturating_sub(period)..];
    let total: u64 = recent.iter().map(|b| b.volume).sum();
    Some(total as f64 / recent.len() as f64)
}

/// Volume-weighted typical price of the last `window` bars.
pub fn vwap(bars: &[PriceBar], window: usize) -> Option<f64> {
    if window == 0 || bars.is_empty() {
        return None;
    }
    let recent = &bars[bars.len().saturating_sub(window)..];
    let total_volume: f64 = recent.iter().map(|b| b.volume as f64).sum();
    if total_volume <= 0.0 {
        return None;
    }
    let weighted: f64 = recent
        .iter()
        .map(|b| b.typical_price() * b.volume as f64)
        .sum();
    Some(weighted / total_volume)
}

/// Classify `price` against the recent VWAP. A relative distance beyond
/// `threshold` (0.005 = 0.5%) sets the bias; missing VWAP is neutral.
pub fn trend_bias(price: f64, bars: &[PriceBar], window: usize, threshold: f64) -> TrendBias {
    let Some(vwap) = vwap(bars, window) else {
        return TrendBias::Neutral;
    };
    let diff = (price - vwap) / vwap;
    if diff > threshold {
        TrendBias::Bullish
    } else if diff < -threshold {
        TrendBias::Bearish
    } else {
        TrendBias::Neutral
    }
}

/// Annualised standard deviation of daily log returns.
pub fn realized_volatility(bars: &[PriceBar]) -> Option<f64> {
    let returns: Vec<f64> = bars
        .windows(2)
        .filter(|w| w[0].close > 0.0 && w[1].close > 0.0)
        .map(|w| (w[1].close / w[0].close).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() * TRADING_DAYS.sqrt())
}
