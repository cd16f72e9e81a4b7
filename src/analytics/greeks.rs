//! Black-Scholes Greeks for European options (no dividends).

use statrs::distribution::{ContinuousCDF, Normal};
use std::f64::consts::PI;

use crate::types::{Greeks, OptionType};

/// Calendar days per year for DTE → T conversion and theta.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Standard normal CDF: Φ(x)
pub fn norm_cdf(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(n) => n.cdf(x),
        Err(_) => f64::NAN,
    }
}

/// Standard normal PDF: φ(x)
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

/// Years to expiry. Same-day contracts are priced with a one-day floor so
/// the model never sees T = 0.
pub fn years_to_expiry(dte: u32) -> f64 {
    dte.max(1) as f64 / DAYS_PER_YEAR
}

/// Inputs to the pricing model.
#[derive(Debug, Clone, Copy)]
pub struct OptionParams {
    pub spot: f64,
    pub strike: f64,
    /// Years.
    pub time_to_expiry: f64,
    pub risk_free_rate: f64,
    /// Annualised implied volatility as a fraction.
    pub iv: f64,
    pub option_type: OptionType,
}

impl OptionParams {
    /// Whether the inputs are usable by the model.
    pub fn is_valid(&self) -> bool {
        self.spot > 0.0
            && self.strike > 0.0
            && self.time_to_expiry > 0.0
            && self.iv > 0.0
            && self.spot.is_finite()
            && self.strike.is_finite()
            && self.iv.is_finite()
    }

    pub fn d1(&self) -> f64 {
        let sqrt_t = self.time_to_expiry.sqrt();
        ((self.spot / self.strike).ln()
            + (self.risk_free_rate + 0.5 * self.iv * self.iv) * self.time_to_expiry)
            / (self.iv * sqrt_t)
    }

    pub fn d2(&self) -> f64 {
        self.d1() - self.iv * self.time_to_expiry.sqrt()
    }
}

/// Delta, gamma, theta (per calendar day) and vega (per vol point).
pub fn calculate(params: &OptionParams) -> Greeks {
    let OptionParams {
        spot: s,
        strike: k,
        time_to_expiry: t,
        risk_free_rate: r,
        iv: sigma,
        option_type,
    } = *params;

    let d1 = params.d1();
    let d2 = params.d2();
    let sqrt_t = t.sqrt();
    let pdf_d1 = norm_pdf(d1);
    let discount = (-r * t).exp();

    let delta = match option_type {
        OptionType::Call => norm_cdf(d1),
        OptionType::Put => norm_cdf(d1) - 1.0,
    };
    let gamma = pdf_d1 / (s * sigma * sqrt_t);
    let decay = -s * pdf_d1 * sigma / (2.0 * sqrt_t);
    let theta_annual = match option_type {
        OptionType::Call => decay - r * k * discount * norm_cdf(d2),
        OptionType::Put => decay + r * k * discount * norm_cdf(-d2),
    };
    let vega = s * pdf_d1 * sqrt_t;

    Greeks {
        delta,
        gamma,
        theta: theta_annual / DAYS_PER_YEAR,
        vega: vega / 100.0,
    }
}

/// Black-Scholes theoretical price, used to sanity check Greeks in tests.
pub fn price(params: &OptionParams) -> f64 {
    let d1 = params.d1();
    let d2 = params.d2();
    let discounted_strike = params.strike * (-params.risk_free_rate * params.time_to_expiry).exp();
    match params.option_type {
        OptionType::Call => params.spot * norm_cdf(d1) - discounted_strike * norm_cdf(d2),
        OptionType::Put => discounted_strike * norm_cdf(-d2) - params.spot * norm_cdf(-d1),
    }
}
