//! Probability metrics: closed-form ITM/OTM and touch estimates plus a
//! Monte Carlo probability of profit under geometric Brownian motion.

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

use super::greeks::{norm_cdf, OptionParams};
use crate::types::{OptionType, ProbabilityMetrics};

/// Risk-neutral probability of finishing in the money: N(d2) / N(-d2).
pub fn probability_itm(params: &OptionParams) -> f64 {
    match params.option_type {
        OptionType::Call => norm_cdf(params.d2()),
        OptionType::Put => norm_cdf(-params.d2()),
    }
}

/// Probability of touching the strike before expiry, approximated as 2|Δ|.
pub fn probability_touch(delta: f64) -> f64 {
    (2.0 * delta.abs()).min(1.0)
}

/// One standard deviation move by expiry, in dollars.
pub fn expected_move(params: &OptionParams) -> f64 {
    params.spot * params.iv * params.time_to_expiry.sqrt()
}

/// Fraction of simulated terminal prices where `profit` is positive.
///
/// Terminal prices follow GBM from the spot in `params` with its IV, rate
/// and time to expiry.
pub fn simulate_pop<R, F>(params: &OptionParams, simulations: u32, rng: &mut R, profit: F) -> f64
where
    R: Rng + ?Sized,
    F: Fn(f64) -> f64,
{
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return 0.0;
    };
    if simulations == 0 {
        return 0.0;
    }

    let t = params.time_to_expiry;
    let drift = (params.risk_free_rate - 0.5 * params.iv * params.iv) * t;
    let diffusion = params.iv * t.sqrt();

    let mut profitable = 0u32;
    for _ in 0..simulations {
        let z = normal.sample(rng);
        let terminal = params.spot * (drift + diffusion * z).exp();
        if profit(terminal) > 0.0 {
            profitable += 1;
        }
    }
    profitable as f64 / simulations as f64
}

/// All probability metrics for a position anchored on the contract in
/// `params`. `profit` maps a terminal price to the position's per-share
/// profit at expiry.
pub fn calculate<R, F>(
    params: &OptionParams,
    delta: f64,
    simulations: u32,
    rng: &mut R,
    profit: F,
) -> ProbabilityMetrics
where
    R: Rng + ?Sized,
    F: Fn(f64) -> f64,
{
    let itm = probability_itm(params);
    ProbabilityMetrics {
        probability_itm: itm,
        probability_otm: 1.0 - itm,
        probability_touch: probability_touch(delta),
        expected_move: expected_move(params),
        probability_of_profit: simulate_pop(params, simulations, rng, profit),
    }
}
