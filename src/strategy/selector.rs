//! Strategy selector.
//!
//! Reads the market condition from the scan candidate and the chain's
//! at-the-money IV, then builds the position that condition calls for:
//!
//! | Condition        | Strategy           | Anchor Δ | Max DTE |
//! |------------------|--------------------|----------|---------|
//! | strong bullish   | long call          | 0.60     | 7       |
//! | strong bearish   | long put           | 0.60     | 7       |
//! | bullish breakout | call debit spread  | 0.50     | 7       |
//! | bearish breakout | put debit spread   | 0.50     | 7       |
//! | high-IV range    | call credit spread | 0.30     | 7       |
//! | choppy           | iron condor        | 0.20     | 2       |
//! | news spike       | none (skip)        |          |         |
//!
//! Spread legs sit `spread_width` away from the anchor at the same expiry.

use serde::Deserialize;
use tracing::debug;

use crate::types::{
    AnalyzedContract, LegAction, MarketCondition, OptionType, RejectReason, ScanCandidate, Stage,
    StrategyKind, TradeLeg, TradePlan, TrendBias,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Volume ratio and ATR that mark strong momentum.
    pub strong_volume_ratio: f64,
    pub strong_min_atr: f64,
    /// Volume ratio that marks a breakout when IV is cheap.
    pub breakout_volume_ratio: f64,
    /// IV percentile bounds for cheap and rich volatility.
    pub low_iv_percentile: f64,
    pub high_iv_percentile: f64,
    /// ATM implied volatility, in percent, treated as a news-driven spike.
    pub news_spike_iv_pct: f64,
    /// Strike distance between spread legs, in dollars.
    pub spread_width: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strong_volume_ratio: 2.0,
            strong_min_atr: 2.5,
            breakout_volume_ratio: 1.5,
            low_iv_percentile: 30.0,
            high_iv_percentile: 60.0,
            news_spike_iv_pct: 100.0,
            spread_width: 5.0,
        }
    }
}

/// How a condition is traded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyTemplate {
    pub kind: StrategyKind,
    /// |Δ| the anchor leg is chosen closest to.
    pub delta_target: f64,
    pub max_dte: u32,
}

/// Template for `condition`. `None` means the condition is not traded.
pub fn template(condition: MarketCondition) -> Option<StrategyTemplate> {
    let (kind, delta_target, max_dte) = match condition {
        MarketCondition::StrongBullish => (StrategyKind::LongCall, 0.60, 7),
        MarketCondition::StrongBearish => (StrategyKind::LongPut, 0.60, 7),
        MarketCondition::BullishBreakout => (StrategyKind::CallDebitSpread, 0.50, 7),
        MarketCondition::BearishBreakout => (StrategyKind::PutDebitSpread, 0.50, 7),
        MarketCondition::HighIvRange => (StrategyKind::CallCreditSpread, 0.30, 7),
        MarketCondition::Choppy => (StrategyKind::IronCondor, 0.20, 2),
        MarketCondition::NewsSpike => return None,
    };
    Some(StrategyTemplate {
        kind,
        delta_target,
        max_dte,
    })
}

/// Rough IV percentile from the ATM IV level (fraction), until an IV
/// history is available to rank against.
pub fn iv_percentile(atm_iv: f64) -> f64 {
    match atm_iv * 100.0 {
        iv if iv < 20.0 => 20.0,
        iv if iv < 30.0 => 35.0,
        iv if iv < 40.0 => 50.0,
        iv if iv < 60.0 => 70.0,
        _ => 85.0,
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

pub struct StrategySelector {
    config: SelectorConfig,
}

type Pool<'a> = Vec<&'a AnalyzedContract>;

impl StrategySelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    fn reject(detail: String) -> RejectReason {
        RejectReason::new(Stage::Strategy, detail)
    }

    /// IV of the contract with |Δ| closest to 0.5, calls preferred.
    pub fn atm_iv(contracts: &[AnalyzedContract]) -> Option<f64> {
        let calls: Pool = contracts
            .iter()
            .filter(|c| c.contract.option_type == OptionType::Call)
            .collect();
        let pool: Pool = if calls.is_empty() {
            contracts.iter().collect()
        } else {
            calls
        };
        closest_delta(&pool, 0.5).map(|c| c.contract.implied_volatility)
    }

    /// Classify the market for `candidate`. Checks run in priority order
    /// and the first match wins.
    pub fn classify(&self, candidate: &ScanCandidate, contracts: &[AnalyzedContract]) -> MarketCondition {
        let cfg = &self.config;
        let atm_iv = Self::atm_iv(contracts);
        let ivp = atm_iv.map_or(50.0, iv_percentile);
        let vr = candidate.volume_ratio;
        let trend = candidate.trend;

        if atm_iv.is_some_and(|iv| iv * 100.0 > cfg.news_spike_iv_pct) {
            return MarketCondition::NewsSpike;
        }

        if vr > cfg.strong_volume_ratio && candidate.atr > cfg.strong_min_atr {
            match trend {
                TrendBias::Bullish => return MarketCondition::StrongBullish,
                TrendBias::Bearish => return MarketCondition::StrongBearish,
                TrendBias::Neutral => {}
            }
        }

        if vr > cfg.breakout_volume_ratio && ivp < cfg.low_iv_percentile {
            match trend {
                TrendBias::Bullish => return MarketCondition::BullishBreakout,
                TrendBias::Bearish => return MarketCondition::BearishBreakout,
                TrendBias::Neutral => {}
            }
        }

        match trend {
            TrendBias::Neutral if ivp > cfg.high_iv_percentile => MarketCondition::HighIvRange,
            TrendBias::Neutral => MarketCondition::Choppy,
            TrendBias::Bullish => MarketCondition::BullishBreakout,
            TrendBias::Bearish => MarketCondition::BearishBreakout,
        }
    }

    /// Build the position for `candidate` from its analyzed contracts.
    pub fn select(
        &self,
        candidate: &ScanCandidate,
        contracts: &[AnalyzedContract],
    ) -> Result<TradePlan, RejectReason> {
        let condition = self.classify(candidate, contracts);
        let Some(template) = template(condition) else {
            return Err(Self::reject(format!(
                "{condition}: ATM IV {:.0}%, not trading",
                Self::atm_iv(contracts).unwrap_or(0.0) * 100.0
            )));
        };

        let legs = match template.kind {
            StrategyKind::LongCall => self.single(contracts, OptionType::Call, &template)?,
            StrategyKind::LongPut => self.single(contracts, OptionType::Put, &template)?,
            StrategyKind::CallDebitSpread => {
                self.vertical(contracts, OptionType::Call, LegAction::Buy, &template)?
            }
            StrategyKind::PutDebitSpread => {
                self.vertical(contracts, OptionType::Put, LegAction::Buy, &template)?
            }
            StrategyKind::CallCreditSpread => {
                self.vertical(contracts, OptionType::Call, LegAction::Sell, &template)?
            }
            StrategyKind::IronCondor => self.iron_condor(contracts, &template)?,
        };

        debug!(
            symbol = %candidate.quote.symbol,
            condition = %condition,
            strategy = %template.kind,
            legs = legs.len(),
            "Strategy selected"
        );

        Ok(TradePlan {
            strategy: template.kind,
            condition,
            legs,
        })
    }

    fn single(
        &self,
        contracts: &[AnalyzedContract],
        option_type: OptionType,
        template: &StrategyTemplate,
    ) -> Result<Vec<TradeLeg>, RejectReason> {
        let pool = side(contracts, option_type, template.max_dte);
        let anchor = closest_delta(&pool, template.delta_target)
            .ok_or_else(|| no_contracts(option_type, template))?;
        Ok(vec![TradeLeg::new(LegAction::Buy, anchor)])
    }

    /// Two legs on one side. Debit spreads buy the anchor, credit spreads
    /// sell it; the protective or financing leg sits `spread_width` out of
    /// the money from it.
    fn vertical(
        &self,
        contracts: &[AnalyzedContract],
        option_type: OptionType,
        anchor_action: LegAction,
        template: &StrategyTemplate,
    ) -> Result<Vec<TradeLeg>, RejectReason> {
        let pool = side(contracts, option_type, template.max_dte);
        let anchor = closest_delta(&pool, template.delta_target)
            .ok_or_else(|| no_contracts(option_type, template))?;

        let other = self.wing(&pool, anchor).ok_or_else(|| {
            Self::reject(format!(
                "no {option_type} strike {:.2} away from {:.2} at {}DTE",
                self.config.spread_width, anchor.contract.strike, anchor.contract.dte
            ))
        })?;

        let other_action = match anchor_action {
            LegAction::Buy => LegAction::Sell,
            LegAction::Sell => LegAction::Buy,
        };
        Ok(vec![
            TradeLeg::new(anchor_action, anchor),
            TradeLeg::new(other_action, other),
        ])
    }

    /// Short call and short put near the template delta at one expiry, each
    /// protected by a long wing `spread_width` further out.
    fn iron_condor(
        &self,
        contracts: &[AnalyzedContract],
        template: &StrategyTemplate,
    ) -> Result<Vec<TradeLeg>, RejectReason> {
        let calls = side(contracts, OptionType::Call, template.max_dte);
        let short_call = closest_delta(&calls, template.delta_target)
            .ok_or_else(|| no_contracts(OptionType::Call, template))?;

        let dte = short_call.contract.dte;
        let puts: Pool = side(contracts, OptionType::Put, template.max_dte)
            .into_iter()
            .filter(|c| c.contract.dte == dte)
            .collect();
        let short_put = closest_delta(&puts, template.delta_target)
            .ok_or_else(|| Self::reject(format!("no puts at {dte}DTE to pair with the short call")))?;

        if short_put.contract.strike >= short_call.contract.strike {
            return Err(Self::reject(format!(
                "short put {:.2} not below short call {:.2}",
                short_put.contract.strike, short_call.contract.strike
            )));
        }

        let long_call = self.wing(&calls, short_call);
        let long_put = self.wing(&puts, short_put);
        let (Some(long_call), Some(long_put)) = (long_call, long_put) else {
            return Err(Self::reject(format!(
                "no wings {:.2} beyond {:.2}P/{:.2}C at {dte}DTE",
                self.config.spread_width, short_put.contract.strike, short_call.contract.strike
            )));
        };

        Ok(vec![
            TradeLeg::new(LegAction::Sell, short_call),
            TradeLeg::new(LegAction::Buy, long_call),
            TradeLeg::new(LegAction::Sell, short_put),
            TradeLeg::new(LegAction::Buy, long_put),
        ])
    }

    /// Same-expiry contract further out of the money than `from`, closest to
    /// `spread_width` away: higher strikes for calls, lower for puts.
    fn wing<'a>(&self, pool: &Pool<'a>, from: &AnalyzedContract) -> Option<&'a AnalyzedContract> {
        let (strike, dte) = (from.contract.strike, from.contract.dte);
        let direction = match from.contract.option_type {
            OptionType::Call => 1.0,
            OptionType::Put => -1.0,
        };
        let target = strike + direction * self.config.spread_width;
        pool.iter()
            .copied()
            .filter(|c| c.contract.dte == dte && (c.contract.strike - strike) * direction > 0.0)
            .min_by(|a, b| {
                (a.contract.strike - target)
                    .abs()
                    .total_cmp(&(b.contract.strike - target).abs())
            })
    }
}

fn side(contracts: &[AnalyzedContract], option_type: OptionType, max_dte: u32) -> Pool<'_> {
    contracts
        .iter()
        .filter(|c| c.contract.option_type == option_type && c.contract.dte <= max_dte)
        .collect()
}

fn closest_delta<'a>(pool: &Pool<'a>, target: f64) -> Option<&'a AnalyzedContract> {
    pool.iter().copied().min_by(|a, b| {
        (a.greeks.delta.abs() - target)
            .abs()
            .total_cmp(&(b.greeks.delta.abs() - target).abs())
    })
}

fn no_contracts(option_type: OptionType, template: &StrategyTemplate) -> RejectReason {
    StrategySelector::reject(format!(
        "no {option_type} contracts within {}DTE for {}",
        template.max_dte, template.kind
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
