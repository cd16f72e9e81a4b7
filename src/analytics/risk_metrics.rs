//! Risk metrics for a position of one contract per leg.
//!
//! Long single options are bought at the ask. Spreads and condors are
//! priced leg by leg (ask when buying, bid when selling), so the net
//! premium already carries the cost of crossing every spread.

use crate::types::{
    LegAction, OptionType, RiskMetrics, StrategyKind, TradeLeg, TradePlan, CONTRACT_MULTIPLIER,
};

/// Minimum reward multiple assumed for calls, whose upside is unbounded.
const MIN_CALL_REWARD_MULTIPLE: f64 = 3.0;

/// Max loss, max gain and break-evens for a long single option.
///
/// `premium` is per share. Call upside is capped at the underlying doubling,
/// and never below 3x the premium paid.
fn long_option(spot: f64, strike: f64, premium: f64, option_type: OptionType) -> (f64, f64, Vec<f64>) {
    let max_loss = premium * CONTRACT_MULTIPLIER;

    let max_gain = match option_type {
        OptionType::Call => {
            let doubled = (2.0 * spot - strike) * CONTRACT_MULTIPLIER - max_loss;
            doubled.max(max_loss * MIN_CALL_REWARD_MULTIPLE)
        }
        OptionType::Put => (strike * CONTRACT_MULTIPLIER - max_loss).max(0.0),
    };

    let break_even = match option_type {
        OptionType::Call => strike + premium,
        OptionType::Put => strike - premium,
    };

    (max_loss, max_gain, vec![break_even])
}

/// Two legs on one side. The anchor is the long leg of a debit spread and
/// the short leg of a credit spread; either way the break-even sits one
/// net premium beyond it.
fn vertical(anchor: &TradeLeg, legs: &[TradeLeg], net_premium: f64) -> (f64, f64, Vec<f64>) {
    let (low, high) = strike_range(legs.iter());
    let width = (high - low) * CONTRACT_MULTIPLIER;
    let net = net_premium * CONTRACT_MULTIPLIER;

    let (max_loss, max_gain) = if net > 0.0 {
        (net, width - net)
    } else {
        (width + net, -net)
    };

    let break_even = match anchor.contract.option_type {
        OptionType::Call => anchor.contract.strike + net_premium.abs(),
        OptionType::Put => anchor.contract.strike - net_premium.abs(),
    };

    (max_loss, max_gain, vec![break_even])
}

/// Short call spread plus short put spread. Only one wing can finish in
/// the money, so the wider wing bounds the loss.
fn iron_condor(legs: &[TradeLeg], net_premium: f64) -> (f64, f64, Vec<f64>) {
    let credit = -net_premium;
    let wing = |option_type: OptionType| {
        let (low, high) = strike_range(legs.iter().filter(|l| l.contract.option_type == option_type));
        (high - low) * CONTRACT_MULTIPLIER
    };
    let short_strike = |option_type: OptionType| {
        legs.iter()
            .find(|l| l.action == LegAction::Sell && l.contract.option_type == option_type)
            .map(|l| l.contract.strike)
    };

    let max_gain = credit * CONTRACT_MULTIPLIER;
    let max_loss = wing(OptionType::Call).max(wing(OptionType::Put)) - max_gain;

    let break_evens = match (short_strike(OptionType::Put), short_strike(OptionType::Call)) {
        (Some(put), Some(call)) => vec![put - credit, call + credit],
        _ => Vec::new(),
    };

    (max_loss, max_gain, break_evens)
}

fn strike_range<'a>(legs: impl Iterator<Item = &'a TradeLeg>) -> (f64, f64) {
    legs.fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), leg| {
        (low.min(leg.contract.strike), high.max(leg.contract.strike))
    })
}

/// Compute max loss/gain, break-evens, R/R and expected value for `plan`.
pub fn calculate(spot: f64, plan: &TradePlan, probability_of_profit: f64) -> RiskMetrics {
    let Some(anchor) = plan.legs.first() else {
        return RiskMetrics::default();
    };
    let net_premium = plan.net_premium();

    let (max_loss, max_gain, break_evens) = match plan.strategy {
        StrategyKind::LongCall | StrategyKind::LongPut => long_option(
            spot,
            anchor.contract.strike,
            net_premium,
            anchor.contract.option_type,
        ),
        StrategyKind::CallDebitSpread
        | StrategyKind::PutDebitSpread
        | StrategyKind::CallCreditSpread => vertical(anchor, &plan.legs, net_premium),
        StrategyKind::IronCondor => iron_condor(&plan.legs, net_premium),
    };

    let risk_reward = if max_loss > 0.0 { max_gain / max_loss } else { 0.0 };
    let pop = probability_of_profit.clamp(0.0, 1.0);
    let expected_value = pop * max_gain - (1.0 - pop) * max_loss;

    RiskMetrics {
        max_loss,
        max_gain,
        risk_reward,
        break_evens,
        expected_value,
    }
}
