//! Bad-data screen for quotes against their own price history.
//!
//! Two checks, both reported as `ScanError::Validation`:
//!
//! - bad tick: the quote moved more than `max_move` from the previous close
//! - outlier: the quote sits more than `max_z_score` standard deviations
//!   from the mean close (or `flat_tolerance` away when closes are flat)

use serde::Deserialize;
use tracing::warn;

use crate::types::{PriceBar, Quote, ScanError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Largest plausible move from the previous close, as a fraction.
    pub max_move: f64,
    pub max_z_score: f64,
    /// Allowed relative deviation from the mean when history is flat.
    pub flat_tolerance: f64,
    /// Closes needed before the outlier check applies.
    pub min_history: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            max_move: 0.50,
            max_z_score: 4.0,
            flat_tolerance: 0.05,
            min_history: 5,
        }
    }
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    /// Fail the quote if it looks like bad data rather than a real move.
    pub fn check(&self, quote: &Quote, history: &[PriceBar]) -> Result<(), ScanError> {
        let invalid = |reason: String| {
            warn!(symbol = %quote.symbol, price = quote.price, reason = %reason, "Quote anomaly");
            ScanError::Validation {
                symbol: quote.symbol.clone(),
                reason,
            }
        };

        if let Some(prev) = history.last() {
            if let Some(change) = self.bad_tick(quote.price, prev.close) {
                return Err(invalid(format!(
                    "bad tick: {:.1}% from previous close {:.2}",
                    change * 100.0,
                    prev.close
                )));
            }
        }

        let closes: Vec<f64> = history.iter().map(|b| b.close).collect();
        if let Some(deviation) = self.outlier(quote.price, &closes) {
            return Err(invalid(deviation));
        }
        Ok(())
    }

    /// Relative move from `prev_close` when it exceeds the limit. Non-positive
    /// prices always count as bad ticks.
    fn bad_tick(&self, price: f64, prev_close: f64) -> Option<f64> {
        if !(price > 0.0 && prev_close > 0.0) {
            return Some(f64::INFINITY);
        }
        let change = (price - prev_close).abs() / prev_close;
        (change > self.config.max_move).then_some(change)
    }

    fn outlier(&self, price: f64, closes: &[f64]) -> Option<String> {
        let cfg = &self.config;
        if closes.len() < cfg.min_history.max(1) {
            return None;
        }

        let n = closes.len() as f64;
        let mean = closes.iter().sum::<f64>() / n;
        let std = (closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n).sqrt();

        if std == 0.0 {
            let deviation = (price - mean).abs() / mean;
            return (deviation > cfg.flat_tolerance).then(|| {
                format!(
                    "price {price:.2} is {:.1}% from flat history at {mean:.2}",
                    deviation * 100.0
                )
            });
        }

        let z = (price - mean).abs() / std;
        (z > cfg.max_z_score).then(|| {
            format!("price {price:.2} is {z:.1} standard deviations from mean close {mean:.2}")
        })
    }
}
