//! Scanner stage: equity-level filters.
//!
//! Runs in two steps so the cheap checks short-circuit before any history
//! is fetched: `screen_quote` (price band, spread) on the quote alone, then
//! `scan` (ATR, volume, trend) once daily bars are available.

use serde::Deserialize;
use tracing::debug;

use crate::analytics::indicators;
use crate::types::{PriceBar, Quote, RejectReason, ScanCandidate, Stage};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub min_price: f64,
    pub max_price: f64,
    /// Minimum 20-day average daily volume.
    pub min_avg_volume: f64,
    /// Session volume must reach this multiple of the average.
    pub volume_multiplier: f64,
    /// Minimum ATR in dollars.
    pub min_atr: f64,
    /// Maximum bid-ask spread, percent of mid.
    pub max_spread_pct: f64,
    pub atr_period: usize,
    pub volume_period: usize,
    pub vwap_bars: usize,
    /// Relative distance from VWAP that sets a directional bias.
    pub vwap_threshold: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_price: 20.0,
            max_price: 300.0,
            min_avg_volume: 1_000_000.0,
            volume_multiplier: 1.3,
            min_atr: 1.5,
            max_spread_pct: 0.2,
            atr_period: 14,
            volume_period: 20,
            vwap_bars: 5,
            vwap_threshold: 0.005,
        }
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    fn reject(detail: String) -> RejectReason {
        RejectReason::new(Stage::Scanner, detail)
    }

    /// Quote-only checks: price band and bid-ask spread.
    pub fn screen_quote(&self, quote: &Quote) -> Result<(), RejectReason> {
        let cfg = &self.config;
        if !(cfg.min_price..=cfg.max_price).contains(&quote.price) {
            return Err(Self::reject(format!(
                "price {:.2} outside [{:.2}, {:.2}]",
                quote.price, cfg.min_price, cfg.max_price
            )));
        }

        let spread = quote.spread_pct();
        if spread > cfg.max_spread_pct {
            return Err(Self::reject(format!(
                "spread {:.3}% above {:.3}%",
                spread, cfg.max_spread_pct
            )));
        }
        Ok(())
    }

    /// Full scan with daily bars. Produces the candidate handed to the
    /// options filter.
    pub fn scan(&self, quote: &Quote, history: &[PriceBar]) -> Result<ScanCandidate, RejectReason> {
        self.screen_quote(quote)?;
        let cfg = &self.config;

        let atr = indicators::atr(history, cfg.atr_period).ok_or_else(|| {
            Self::reject(format!(
                "{} bars, need {} for ATR",
                history.len(),
                cfg.atr_period + 1
            ))
        })?;
        if atr < cfg.min_atr {
            return Err(Self::reject(format!(
                "ATR {:.2} below {:.2}",
                atr, cfg.min_atr
            )));
        }

        let avg_volume = indicators::average_volume(history, cfg.volume_period)
            .ok_or_else(|| Self::reject("no volume history".to_string()))?;
        if !(avg_volume > 0.0) || avg_volume < cfg.min_avg_volume {
            return Err(Self::reject(format!(
                "avg volume {:.0} below {:.0}",
                avg_volume, cfg.min_avg_volume
            )));
        }

        let volume_ratio = quote.volume as f64 / avg_volume;
        if !volume_ratio.is_finite() || volume_ratio < cfg.volume_multiplier {
            return Err(Self::reject(format!(
                "volume {:.2}x average, need {:.2}x",
                volume_ratio, cfg.volume_multiplier
            )));
        }

        let trend = indicators::trend_bias(quote.price, history, cfg.vwap_bars, cfg.vwap_threshold);
        let realized_volatility = indicators::realized_volatility(history).unwrap_or(0.0);

        debug!(
            symbol = %quote.symbol,
            price = format!("${:.2}", quote.price),
            atr = format!("{:.2}", atr),
            volume_ratio = format!("{:.2}", volume_ratio),
            trend = %trend,
            "Scanner passed"
        );

        Ok(ScanCandidate {
            quote: quote.clone(),
            avg_volume,
            volume_ratio,
            atr,
            trend,
            realized_volatility,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
