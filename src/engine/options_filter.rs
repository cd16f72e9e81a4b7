//! OptionsFilter stage: liquidity and expiry screen over an option chain.
//!
//! The side follows the scanner's trend bias: calls on a bullish bias,
//! puts on a bearish one, both when neutral.

use serde::Deserialize;
use tracing::debug;

use crate::types::{OptionContract, OptionType, RejectReason, ScanCandidate, Stage, TrendBias};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsFilterConfig {
    pub min_dte: u32,
    pub max_dte: u32,
    pub min_open_interest: u64,
    pub min_volume: u64,
    /// Maximum bid-ask spread, percent of mid.
    pub max_spread_pct: f64,
}

impl Default for OptionsFilterConfig {
    fn default() -> Self {
        Self {
            min_dte: 0,
            max_dte: 7,
            min_open_interest: 1_000,
            min_volume: 300,
            max_spread_pct: 5.0,
        }
    }
}

pub struct OptionsFilter {
    config: OptionsFilterConfig,
}

impl OptionsFilter {
    pub fn new(config: OptionsFilterConfig) -> Self {
        Self { config }
    }

    fn side_allowed(trend: TrendBias, option_type: OptionType) -> bool {
        match trend {
            TrendBias::Bullish => option_type == OptionType::Call,
            TrendBias::Bearish => option_type == OptionType::Put,
            TrendBias::Neutral => true,
        }
    }

    /// Whether a single contract is liquid and inside the DTE window.
    pub fn is_liquid(&self, contract: &OptionContract) -> bool {
        let cfg = &self.config;
        (cfg.min_dte..=cfg.max_dte).contains(&contract.dte)
            && contract.open_interest >= cfg.min_open_interest
            && contract.volume >= cfg.min_volume
            && contract.spread_pct() <= cfg.max_spread_pct
    }

    /// Contracts from `chain` worth analyzing. An empty result rejects the
    /// symbol.
    pub fn filter(
        &self,
        candidate: &ScanCandidate,
        chain: &[OptionContract],
    ) -> Result<Vec<OptionContract>, RejectReason> {
        let symbol = &candidate.quote.symbol;
        let trend = candidate.trend;

        let survivors: Vec<OptionContract> = chain
            .iter()
            .filter(|c| &c.underlying == symbol)
            .filter(|c| Self::side_allowed(trend, c.option_type))
            .filter(|c| self.is_liquid(c))
            .cloned()
            .collect();

        debug!(
            symbol = %symbol,
            trend = %trend,
            chain = chain.len(),
            liquid = survivors.len(),
            "Options filtered"
        );

        if survivors.is_empty() {
            return Err(RejectReason::new(
                Stage::OptionsFilter,
                format!(
                    "no liquid {} contracts in {} listed",
                    match trend {
                        TrendBias::Bullish => "call",
                        TrendBias::Bearish => "put",
                        TrendBias::Neutral => "call/put",
                    },
                    chain.len()
                ),
            ));
        }
        Ok(survivors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quote;
    use chrono::Utc;

    // ---- helpers ----

    fn candidate(trend: TrendBias) -> ScanCandidate {
        ScanCandidate {
            quote: Quote {
                symbol: "META".into(),
                price: 250.0,
                bid: 249.98,
                ask: 250.02,
                volume: 20_000_000,
                timestamp: Utc::now(),
            },
            avg_volume: 12_000_000.0,
            volume_ratio: 1.67,
            atr: 6.0,
            trend,
            realized_volatility: 0.35,
        }
    }

    fn contract(option_type: OptionType) -> OptionContract {
        OptionContract {
            underlying: "META".into(),
            strike: 250.0,
            dte: 3,
            option_type,
            bid: 4.00,
            ask: 4.10,
            open_interest: 5_000,
            volume: 1_200,
            implied_volatility: 0.40,
        }
    }

    #[test]
    fn test_liquidity_thresholds() {
        let f = OptionsFilter::new(OptionsFilterConfig::default());
        let ok = contract(OptionType::Call);
        assert!(f.is_liquid(&ok));

        assert!(!f.is_liquid(&OptionContract { dte: 8, ..ok.clone() }));
        assert!(!f.is_liquid(&OptionContract { open_interest: 999, ..ok.clone() }));
        assert!(!f.is_liquid(&OptionContract { volume: 299, ..ok.clone() }));
        // 0.50 wide on a 4.25 mid is ~11.8%
        assert!(!f.is_liquid(&OptionContract { bid: 4.00, ask: 4.50, ..ok.clone() }));
        assert!(!f.is_liquid(&OptionContract { bid: 0.0, ..ok }));
    }

    #[test]
    fn test_side_follows_trend() {
        let f = OptionsFilter::new(OptionsFilterConfig::default());
        let chain = vec![contract(OptionType::Call), contract(OptionType::Put)];

        let bull = f.filter(&candidate(TrendBias::Bullish), &chain).unwrap();
        assert!(bull.iter().all(|c| c.option_type == OptionType::Call));

        let bear = f.filter(&candidate(TrendBias::Bearish), &chain).unwrap();
        assert!(bear.iter().all(|c| c.option_type == OptionType::Put));

        assert_eq!(f.filter(&candidate(TrendBias::Neutral), &chain).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_result_rejects() {
        let f = OptionsFilter::new(OptionsFilterConfig::default());
        let chain = vec![contract(OptionType::Put)];
        let err = f.filter(&candidate(TrendBias::Bullish), &chain).unwrap_err();
        assert_eq!(err.stage, Stage::OptionsFilter);
        assert!(f.filter(&candidate(TrendBias::Neutral), &[]).is_err());
    }

    #[test]
    fn test_foreign_underlying_ignored() {
        let f = OptionsFilter::new(OptionsFilterConfig::default());
        let mut other = contract(OptionType::Call);
        other.underlying = "AAPL".into();
        assert!(f.filter(&candidate(TrendBias::Neutral), &[other]).is_err());
    }
}
