//! Shared types for the OPTSCOUT scan engine.
//!
//! These types form the data model used across all modules: upstream
//! market data (quotes, bars, option contracts), the analytics produced
//! for each contract, the scored `CandidateTrade`, and the error taxonomy
//! every stage reports through.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Shares controlled by one equity option contract.
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Real-time equity quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    /// Last traded price.
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    /// Session volume so far.
    pub volume: u64,
    /// Upstream quote time. Drives the freshness check.
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ${:.2} (bid {:.2} / ask {:.2}, vol {})",
            self.symbol, self.price, self.bid, self.ask, self.volume,
        )
    }
}

impl Quote {
    /// Age of the quote relative to now. Future timestamps count as zero age.
    pub fn age(&self) -> chrono::Duration {
        (Utc::now() - self.timestamp).max(chrono::Duration::zero())
    }

    /// Whether the quote is young enough to act on.
    pub fn is_fresh(&self, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => self.age() <= window,
            Err(_) => true,
        }
    }

    /// Bid-ask spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> f64 {
        spread_pct(self.bid, self.ask)
    }

    /// Reject quotes with missing or nonsensical prices.
    pub fn validate(&self) -> Result<(), ScanError> {
        let prices = [("price", self.price), ("bid", self.bid), ("ask", self.ask)];
        for (field, value) in prices {
            if !value.is_finite() || value < 0.0 {
                return Err(ScanError::Validation {
                    symbol: self.symbol.clone(),
                    reason: format!("invalid {field}: {value}"),
                });
            }
        }
        if self.price == 0.0 {
            return Err(ScanError::Validation {
                symbol: self.symbol.clone(),
                reason: "zero last price".to_string(),
            });
        }
        Ok(())
    }
}

/// One daily OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl PriceBar {
    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "CALL"),
            OptionType::Put => write!(f, "PUT"),
        }
    }
}

/// A listed option contract from the upstream chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub underlying: String,
    pub strike: f64,
    /// Days to expiration.
    pub dte: u32,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    pub open_interest: u64,
    pub volume: u64,
    /// Annualised implied volatility as a fraction (0.35 = 35%).
    pub implied_volatility: f64,
}

impl fmt::Display for OptionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.2} {} {}DTE (bid {:.2} / ask {:.2}, OI {}, IV {:.0}%)",
            self.underlying,
            self.strike,
            self.option_type,
            self.dte,
            self.bid,
            self.ask,
            self.open_interest,
            self.implied_volatility * 100.0,
        )
    }
}

impl OptionContract {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_pct(&self) -> f64 {
        spread_pct(self.bid, self.ask)
    }

    /// Per-share value at expiry for an underlying at `spot`.
    pub fn intrinsic(&self, spot: f64) -> f64 {
        match self.option_type {
            OptionType::Call => (spot - self.strike).max(0.0),
            OptionType::Put => (self.strike - spot).max(0.0),
        }
    }
}

/// Bid-ask spread as a percentage of mid. Crossed, empty or one-sided
/// markets return `f64::INFINITY` so they fail any spread threshold.
pub fn spread_pct(bid: f64, ask: f64) -> f64 {
    if !(bid > 0.0 && ask > 0.0) || ask < bid {
        return f64::INFINITY;
    }
    let mid = (bid + ask) / 2.0;
    (ask - bid) / mid * 100.0
}

// ---------------------------------------------------------------------------
// Scan products
// ---------------------------------------------------------------------------

/// Price position relative to recent VWAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for TrendBias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendBias::Bullish => write!(f, "bullish"),
            TrendBias::Bearish => write!(f, "bearish"),
            TrendBias::Neutral => write!(f, "neutral"),
        }
    }
}

/// A quote that passed the scanner, with the indicators computed for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCandidate {
    pub quote: Quote,
    pub avg_volume: f64,
    /// Session volume divided by the recent average.
    pub volume_ratio: f64,
    pub atr: f64,
    pub trend: TrendBias,
    /// Annualised realized volatility from daily closes.
    pub realized_volatility: f64,
}

/// Option sensitivities for one contract, or the net of a multi-leg
/// position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per 1 vol point.
    pub vega: f64,
}

impl Greeks {
    /// `self` scaled by `factor`, e.g. -1.0 for a short leg.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            theta: self.theta * factor,
            vega: self.vega * factor,
        }
    }
}

impl std::ops::Add for Greeks {
    type Output = Greeks;

    fn add(self, rhs: Greeks) -> Greeks {
        Greeks {
            delta: self.delta + rhs.delta,
            gamma: self.gamma + rhs.gamma,
            theta: self.theta + rhs.theta,
            vega: self.vega + rhs.vega,
        }
    }
}

/// Probability figures for a position. The closed-form fields describe the
/// anchor leg; `probability_of_profit` covers the whole position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityMetrics {
    pub probability_itm: f64,
    pub probability_otm: f64,
    pub probability_touch: f64,
    /// One standard deviation move by expiration, in dollars.
    pub expected_move: f64,
    /// Monte Carlo probability that the position's expiry payoff beats
    /// its net premium.
    pub probability_of_profit: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Dollars per position (one contract per leg).
    pub max_loss: f64,
    pub max_gain: f64,
    pub risk_reward: f64,
    /// Underlying prices where the expiry payoff crosses zero. Two for an
    /// iron condor, one otherwise.
    pub break_evens: Vec<f64>,
    pub expected_value: f64,
}

/// A listed contract with its Greeks attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedContract {
    pub contract: OptionContract,
    pub greeks: Greeks,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Market regime read from the scan candidate and the chain's ATM IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketCondition {
    StrongBullish,
    StrongBearish,
    BullishBreakout,
    BearishBreakout,
    HighIvRange,
    Choppy,
    NewsSpike,
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketCondition::StrongBullish => "strong bullish",
            MarketCondition::StrongBearish => "strong bearish",
            MarketCondition::BullishBreakout => "bullish breakout",
            MarketCondition::BearishBreakout => "bearish breakout",
            MarketCondition::HighIvRange => "high-IV range",
            MarketCondition::Choppy => "choppy",
            MarketCondition::NewsSpike => "news spike",
        };
        write!(f, "{s}")
    }
}

/// Position structure built for a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    LongCall,
    LongPut,
    CallDebitSpread,
    PutDebitSpread,
    CallCreditSpread,
    IronCondor,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::LongCall => "long call",
            StrategyKind::LongPut => "long put",
            StrategyKind::CallDebitSpread => "call debit spread",
            StrategyKind::PutDebitSpread => "put debit spread",
            StrategyKind::CallCreditSpread => "call credit spread",
            StrategyKind::IronCondor => "iron condor",
        };
        write!(f, "{s}")
    }
}

impl StrategyKind {
    /// Direction the position profits from.
    pub fn bias(&self) -> TrendBias {
        match self {
            StrategyKind::LongCall | StrategyKind::CallDebitSpread => TrendBias::Bullish,
            StrategyKind::LongPut | StrategyKind::PutDebitSpread | StrategyKind::CallCreditSpread => {
                TrendBias::Bearish
            }
            StrategyKind::IronCondor => TrendBias::Neutral,
        }
    }

    /// Opened for a net credit, so rich implied volatility helps.
    pub fn is_credit(&self) -> bool {
        matches!(self, StrategyKind::CallCreditSpread | StrategyKind::IronCondor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LegAction {
    Buy,
    Sell,
}

impl LegAction {
    /// +1 for a long leg, -1 for a short one.
    pub fn sign(&self) -> f64 {
        match self {
            LegAction::Buy => 1.0,
            LegAction::Sell => -1.0,
        }
    }
}

impl fmt::Display for LegAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegAction::Buy => write!(f, "BUY"),
            LegAction::Sell => write!(f, "SELL"),
        }
    }
}

/// One contract of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub action: LegAction,
    pub contract: OptionContract,
    pub greeks: Greeks,
}

impl TradeLeg {
    pub fn new(action: LegAction, analyzed: &AnalyzedContract) -> Self {
        Self {
            action,
            contract: analyzed.contract.clone(),
            greeks: analyzed.greeks,
        }
    }

    /// Per-share fill: the ask when buying, the bid when selling.
    pub fn fill_price(&self) -> f64 {
        match self.action {
            LegAction::Buy => self.contract.ask,
            LegAction::Sell => self.contract.bid,
        }
    }

    /// Signed per-share cash outlay. Positive is paid, negative received.
    pub fn cost(&self) -> f64 {
        self.action.sign() * self.fill_price()
    }

    /// Signed per-share value at expiry for an underlying at `spot`.
    pub fn payoff_at(&self, spot: f64) -> f64 {
        self.action.sign() * self.contract.intrinsic(spot)
    }
}

impl fmt::Display for TradeLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.contract.option_type {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        };
        write!(
            f,
            "{} {:.2}{} @ {:.2}",
            self.action,
            self.contract.strike,
            side,
            self.fill_price()
        )
    }
}

/// Legs chosen by the strategy selector, anchor leg first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    pub strategy: StrategyKind,
    pub condition: MarketCondition,
    pub legs: Vec<TradeLeg>,
}

impl TradePlan {
    /// Net per-share premium. Positive for a debit, negative for a credit.
    pub fn net_premium(&self) -> f64 {
        self.legs.iter().map(TradeLeg::cost).sum()
    }

    pub fn net_greeks(&self) -> Greeks {
        self.legs
            .iter()
            .map(|leg| leg.greeks.scaled(leg.action.sign()))
            .fold(Greeks::default(), |acc, g| acc + g)
    }

    /// Per-share profit at expiry for an underlying at `spot`, net of premium.
    pub fn profit_at(&self, spot: f64) -> f64 {
        self.legs.iter().map(|leg| leg.payoff_at(spot)).sum::<f64>() - self.net_premium()
    }

    /// Days to the nearest leg expiry.
    pub fn dte(&self) -> u32 {
        self.legs.iter().map(|leg| leg.contract.dte).min().unwrap_or(0)
    }
}

/// A plan with position-level analytics, ready for scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedTrade {
    pub plan: TradePlan,
    /// Net Greeks across legs, per share.
    pub greeks: Greeks,
    pub probability: ProbabilityMetrics,
    pub risk: RiskMetrics,
}

/// Hour (UTC) at which expiring contracts settle.
pub const EXPIRY_HOUR_UTC: i64 = 21;

/// Settlement time of a contract opened at `opened` with `dte` days left.
pub fn expiry_after(opened: DateTime<Utc>, dte: u32) -> DateTime<Utc> {
    let day = opened.date_naive() + chrono::Duration::days(i64::from(dte));
    let settles = day.and_time(chrono::NaiveTime::MIN) + chrono::Duration::hours(EXPIRY_HOUR_UTC);
    Utc.from_utc_datetime(&settles)
}

// ---------------------------------------------------------------------------
// Scored trades
// ---------------------------------------------------------------------------

/// Individual score components, each normalised to [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub probability: f64,
    pub risk_reward: f64,
    pub iv_edge: f64,
    pub liquidity: f64,
    pub trend_alignment: f64,
}

/// A fully scored trade idea. Immutable once scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTrade {
    pub id: Uuid,
    pub candidate: ScanCandidate,
    pub strategy: StrategyKind,
    pub condition: MarketCondition,
    pub legs: Vec<TradeLeg>,
    /// Net position Greeks, per share.
    pub greeks: Greeks,
    pub probability: ProbabilityMetrics,
    pub risk: RiskMetrics,
    pub breakdown: ScoreBreakdown,
    /// Composite score in [0, 100].
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for CandidateTrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1}] {} {} {}DTE ({}) | POP {:.0}% | R/R {:.2} | max loss ${:.0}",
            self.score,
            self.symbol(),
            self.strategy,
            self.dte(),
            self.legs_summary(),
            self.probability.probability_of_profit * 100.0,
            self.risk.risk_reward,
            self.risk.max_loss,
        )
    }
}

impl CandidateTrade {
    pub fn symbol(&self) -> &str {
        &self.candidate.quote.symbol
    }

    /// Share-equivalent net delta of the position.
    pub fn delta_exposure(&self) -> f64 {
        self.greeks.delta * CONTRACT_MULTIPLIER
    }

    /// Net dollar theta per day of the position.
    pub fn theta_exposure(&self) -> f64 {
        self.greeks.theta * CONTRACT_MULTIPLIER
    }

    pub fn dte(&self) -> u32 {
        self.legs.iter().map(|leg| leg.contract.dte).min().unwrap_or(0)
    }

    /// When the nearest leg settles.
    pub fn expires_at(&self) -> DateTime<Utc> {
        expiry_after(self.created_at, self.dte())
    }

    /// "BUY 102.00C @ 1.22 / SELL 107.00C @ 0.04"
    pub fn legs_summary(&self) -> String {
        self.legs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" / ")
    }
}

// ---------------------------------------------------------------------------
// Stage rejections
// ---------------------------------------------------------------------------

/// Pipeline stage identifiers, used for rejection reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Scanner,
    OptionsFilter,
    Analytics,
    Strategy,
    Scorer,
    Risk,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Scanner => write!(f, "scanner"),
            Stage::OptionsFilter => write!(f, "options-filter"),
            Stage::Analytics => write!(f, "analytics"),
            Stage::Strategy => write!(f, "strategy"),
            Stage::Scorer => write!(f, "scorer"),
            Stage::Risk => write!(f, "risk"),
        }
    }
}

/// Why a stage declined a symbol. Not an error: rejections are the
/// normal outcome for most of the universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectReason {
    pub stage: Stage,
    pub detail: String,
}

impl RejectReason {
    pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.detail)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A portfolio limit the candidate would break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RiskViolation {
    #[error("position limit reached ({open}/{limit})")]
    PositionCount { open: usize, limit: usize },

    #[error("max loss ${max_loss:.2} exceeds per-trade limit ${limit:.2}")]
    MaxLoss { max_loss: f64, limit: f64 },

    #[error("aggregate delta would be {projected:.1} (limit ±{limit:.1})")]
    DeltaExposure { projected: f64, limit: f64 },

    #[error("aggregate theta would be {projected:.2}/day (limit ±{limit:.2})")]
    ThetaExposure { projected: f64, limit: f64 },

    #[error("sector {sector} already holds {open} positions (limit {limit})")]
    SectorConcentration {
        sector: String,
        open: usize,
        limit: usize,
    },
}

/// Domain errors. Everything except `Configuration` is recovered per symbol.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("invalid data for {symbol}: {reason}")]
    Validation { symbol: String, reason: String },

    #[error("{endpoint} unavailable for {symbol}: circuit open (retry in {retry_in:?})")]
    DataUnavailable {
        symbol: String,
        endpoint: &'static str,
        retry_in: Duration,
    },

    #[error("{endpoint} failed for {symbol} after {attempts} attempt(s): {last_error}")]
    Upstream {
        symbol: String,
        endpoint: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("risk limit exceeded for {symbol}: {violation}")]
    RiskLimitExceeded {
        symbol: String,
        violation: RiskViolation,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
