//! Analytics stage.
//!
//! Two passes: `analyze_all` attaches Greeks to every liquid contract so
//! the strategy selector can pick strikes by delta, then `evaluate` prices
//! the chosen legs as one position (net Greeks, Monte Carlo probability of
//! profit, risk metrics).
//!
//! Pure over its inputs. With `seed` configured, every position evaluation
//! draws from a fresh RNG seeded identically, so results do not depend on
//! worker scheduling.

pub mod greeks;
pub mod indicators;
pub mod probability;
pub mod risk_metrics;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::debug;

use crate::types::{
    AnalyzedContract, AnalyzedTrade, OptionContract, Quote, RejectReason, Stage, TradePlan,
};
use greeks::OptionParams;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub risk_free_rate: f64,
    /// Monte Carlo paths per position.
    pub simulations: u32,
    /// Fixed RNG seed. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.05,
            simulations: 10_000,
            seed: None,
        }
    }
}

pub struct Analytics {
    config: AnalyticsConfig,
}

impl Analytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self { config }
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn params(&self, quote: &Quote, contract: &OptionContract) -> OptionParams {
        OptionParams {
            spot: quote.price,
            strike: contract.strike,
            time_to_expiry: greeks::years_to_expiry(contract.dte),
            risk_free_rate: self.config.risk_free_rate,
            iv: contract.implied_volatility,
            option_type: contract.option_type,
        }
    }

    /// Greeks for a single contract against the underlying quote.
    pub fn analyze(
        &self,
        quote: &Quote,
        contract: &OptionContract,
    ) -> Result<AnalyzedContract, RejectReason> {
        let params = self.params(quote, contract);
        if !params.is_valid() {
            return Err(RejectReason::new(
                Stage::Analytics,
                format!("unpriceable contract {contract}"),
            ));
        }
        if !(contract.bid > 0.0 && contract.ask > 0.0) {
            return Err(RejectReason::new(
                Stage::Analytics,
                format!("no two-sided market for {contract}"),
            ));
        }

        Ok(AnalyzedContract {
            contract: contract.clone(),
            greeks: greeks::calculate(&params),
        })
    }

    /// Price the legs of `plan` as one position.
    ///
    /// Closed-form probabilities come from the anchor leg; the probability
    /// of profit simulates the combined expiry payoff net of premium.
    pub fn evaluate(&self, quote: &Quote, plan: TradePlan) -> Result<AnalyzedTrade, RejectReason> {
        let Some(anchor) = plan.legs.first() else {
            return Err(RejectReason::new(Stage::Analytics, "plan has no legs"));
        };
        let params = self.params(quote, &anchor.contract);
        if !params.is_valid() {
            return Err(RejectReason::new(
                Stage::Analytics,
                format!("unpriceable anchor {}", anchor.contract),
            ));
        }

        let greeks = plan.net_greeks();
        let probability = probability::calculate(
            &params,
            anchor.greeks.delta,
            self.config.simulations,
            &mut self.rng(),
            |terminal| plan.profit_at(terminal),
        );
        let risk = risk_metrics::calculate(quote.price, &plan, probability.probability_of_profit);

        let payoff_ok = [risk.max_loss, risk.max_gain]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0);
        if !payoff_ok {
            return Err(RejectReason::new(
                Stage::Analytics,
                format!(
                    "{} has no defined payoff (max loss {:.2}, max gain {:.2})",
                    plan.strategy, risk.max_loss, risk.max_gain
                ),
            ));
        }

        debug!(
            symbol = %quote.symbol,
            strategy = %plan.strategy,
            net_premium = format!("{:.2}", plan.net_premium()),
            pop = format!("{:.2}", probability.probability_of_profit),
            max_loss = format!("{:.0}", risk.max_loss),
            "Position evaluated"
        );

        Ok(AnalyzedTrade {
            plan,
            greeks,
            probability,
            risk,
        })
    }

    /// Analyze every contract, dropping unpriceable ones. Rejects the symbol
    /// if nothing survives.
    pub fn analyze_all(
        &self,
        quote: &Quote,
        contracts: &[OptionContract],
    ) -> Result<Vec<AnalyzedContract>, RejectReason> {
        let mut analyzed = Vec::with_capacity(contracts.len());
        for contract in contracts {
            match self.analyze(quote, contract) {
                Ok(a) => analyzed.push(a),
                Err(reason) => debug!(symbol = %quote.symbol, reason = %reason, "Contract skipped"),
            }
        }

        if analyzed.is_empty() {
            return Err(RejectReason::new(
                Stage::Analytics,
                format!("none of {} contracts could be priced", contracts.len()),
            ));
        }
        Ok(analyzed)
    }
}
