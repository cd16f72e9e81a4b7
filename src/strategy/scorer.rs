//! Scorer stage.
//!
//! Each position gets five components normalised to [0, 1]; the composite
//! score is their weighted sum scaled to 0–100 and rounded to one decimal:
//!
//! ```text
//! score = 100 × (w_pop·POP + w_rr·RR + w_iv·IV_edge + w_liq·liquidity + w_trend·trend)
//! ```

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::types::{
    AnalyzedTrade, CandidateTrade, OptionContract, RejectReason, ScanCandidate, ScanError,
    ScoreBreakdown, Stage, StrategyKind, TrendBias,
};

/// Tolerance on the weight sum.
const WEIGHT_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub probability: f64,
    pub risk_reward: f64,
    pub iv_edge: f64,
    pub liquidity: f64,
    pub trend: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            probability: 0.30,
            risk_reward: 0.25,
            iv_edge: 0.20,
            liquidity: 0.15,
            trend: 0.10,
        }
    }
}

impl ScoringWeights {
    fn as_array(&self) -> [f64; 5] {
        [
            self.probability,
            self.risk_reward,
            self.iv_edge,
            self.liquidity,
            self.trend,
        ]
    }

    /// Weights must be finite, non-negative and sum to 1.0.
    pub fn validate(&self) -> Result<(), ScanError> {
        let weights = self.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ScanError::Configuration(format!(
                "scoring weights must be non-negative: {weights:?}"
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ScanError::Configuration(format!(
                "scoring weights sum to {sum:.6}, expected 1.0"
            )));
        }
        Ok(())
    }

    /// Weighted composite on a 0–100 scale, rounded to one decimal.
    pub fn apply(&self, b: &ScoreBreakdown) -> f64 {
        let raw = self.probability * b.probability
            + self.risk_reward * b.risk_reward
            + self.iv_edge * b.iv_edge
            + self.liquidity * b.liquidity
            + self.trend * b.trend_alignment;
        (raw * 1_000.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Candidates below this score are dropped.
    pub min_score: f64,
    /// R/R at which the risk-reward component saturates.
    pub max_risk_reward: f64,
    /// Open interest scores 0 at `oi_floor` and 1 at `oi_full`.
    pub oi_floor: u64,
    pub oi_full: u64,
    /// Option volume scores 0 at `volume_floor` and 1 at `volume_full`.
    pub volume_floor: u64,
    pub volume_full: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            min_score: 70.0,
            max_risk_reward: 3.0,
            oi_floor: 1_000,
            oi_full: 5_000,
            volume_floor: 300,
            volume_full: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

fn linear(value: u64, floor: u64, full: u64) -> f64 {
    if value < floor {
        return 0.0;
    }
    if full <= floor {
        return 1.0;
    }
    ((value - floor) as f64 / (full - floor) as f64).min(1.0)
}

/// Cheap implied vol relative to realized favours a premium buyer; rich
/// implied vol favours a premium seller. Unknown realized vol scores neutral.
pub fn iv_edge(implied: f64, realized: f64, credit: bool) -> f64 {
    if realized.is_nan() || realized <= 0.0 || !implied.is_finite() {
        return 0.5;
    }
    let cheapness = 0.5 * (realized - implied) / realized;
    let edge = if credit { 0.5 - cheapness } else { 0.5 + cheapness };
    edge.clamp(0.0, 1.0)
}

/// Direction match between the strategy and the scanner trend. Neutral
/// strategies want a neutral tape.
pub fn trend_alignment(trend: TrendBias, strategy: StrategyKind, volume_ratio: f64) -> f64 {
    match (strategy.bias(), trend) {
        (TrendBias::Neutral, TrendBias::Neutral) => 0.75,
        (TrendBias::Neutral, _) => 0.5,
        (_, TrendBias::Neutral) => 0.6,
        (bias, trend) if bias == trend && volume_ratio > 2.0 => 0.9,
        (bias, trend) if bias == trend => 0.8,
        _ => 0.2,
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    /// Fails with `ScanError::Configuration` on invalid weights.
    pub fn new(config: ScoringConfig) -> Result<Self, ScanError> {
        config.weights.validate()?;
        Ok(Self { config })
    }

    pub fn min_score(&self) -> f64 {
        self.config.min_score
    }

    fn liquidity(&self, contract: &OptionContract) -> f64 {
        let cfg = &self.config;
        let oi = linear(contract.open_interest, cfg.oi_floor, cfg.oi_full);
        let volume = linear(contract.volume, cfg.volume_floor, cfg.volume_full);
        // 0% spread scores 1, 5% or wider scores 0
        let spread = (1.0 - contract.spread_pct() / 5.0).clamp(0.0, 1.0);
        0.4 * oi + 0.4 * volume + 0.2 * spread
    }

    pub fn breakdown(&self, candidate: &ScanCandidate, analyzed: &AnalyzedTrade) -> ScoreBreakdown {
        let plan = &analyzed.plan;
        let legs = plan.legs.len().max(1) as f64;
        let max_rr = self.config.max_risk_reward.max(f64::EPSILON);
        let mean_iv = plan
            .legs
            .iter()
            .map(|l| l.contract.implied_volatility)
            .sum::<f64>()
            / legs;
        let liquidity = plan.legs.iter().map(|l| self.liquidity(&l.contract)).sum::<f64>() / legs;

        ScoreBreakdown {
            probability: analyzed.probability.probability_of_profit.clamp(0.0, 1.0),
            risk_reward: (analyzed.risk.risk_reward / max_rr).clamp(0.0, 1.0),
            iv_edge: iv_edge(mean_iv, candidate.realized_volatility, plan.strategy.is_credit()),
            liquidity,
            trend_alignment: trend_alignment(candidate.trend, plan.strategy, candidate.volume_ratio),
        }
    }

    /// Score one analyzed position, rejecting it below the minimum score.
    pub fn score(
        &self,
        candidate: &ScanCandidate,
        analyzed: AnalyzedTrade,
    ) -> Result<CandidateTrade, RejectReason> {
        let breakdown = self.breakdown(candidate, &analyzed);
        let score = self.config.weights.apply(&breakdown);

        debug!(
            symbol = %candidate.quote.symbol,
            strategy = %analyzed.plan.strategy,
            score = format!("{score:.1}"),
            pop = format!("{:.2}", breakdown.probability),
            rr = format!("{:.2}", breakdown.risk_reward),
            iv = format!("{:.2}", breakdown.iv_edge),
            liq = format!("{:.2}", breakdown.liquidity),
            trend = format!("{:.2}", breakdown.trend_alignment),
            "Position scored"
        );

        if score < self.config.min_score {
            return Err(RejectReason::new(
                Stage::Scorer,
                format!(
                    "{} scored {score:.1}, minimum {:.1}",
                    analyzed.plan.strategy, self.config.min_score
                ),
            ));
        }

        let AnalyzedTrade {
            plan,
            greeks,
            probability,
            risk,
        } = analyzed;
        Ok(CandidateTrade {
            id: Uuid::new_v4(),
            candidate: candidate.clone(),
            strategy: plan.strategy,
            condition: plan.condition,
            legs: plan.legs,
            greeks,
            probability,
            risk,
            breakdown,
            score,
            created_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
