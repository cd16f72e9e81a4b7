//! Portfolio risk manager.
//!
//! Owns the aggregate `PortfolioState` and gates every candidate through a
//! fixed sequence of checks:
//!
//! 1. open position count
//! 2. max loss per trade
//! 3. aggregate delta after adding the candidate
//! 4. aggregate theta after adding the candidate
//! 5. open positions in the candidate's sector
//!
//! Check and update happen under one lock, so concurrent callers can never
//! both pass against the same pre-trade snapshot.
//!
//! Positions carry their settlement time and release their exposure once
//! it passes (`expire_positions`, called at the start of every run).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{CandidateTrade, RiskViolation, ScanError};

/// Bucket for symbols the sector lookup does not know.
pub const UNCLASSIFIED_SECTOR: &str = "UNCLASSIFIED";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_positions: usize,
    /// Dollars per contract.
    pub max_loss_per_trade: f64,
    /// Absolute cap on share-equivalent portfolio delta.
    pub max_abs_delta: f64,
    /// Absolute cap on portfolio theta, dollars per day.
    pub max_abs_theta: f64,
    pub max_per_sector: usize,
    /// Symbol → sector, used by the default `StaticSectorMap`.
    pub sectors: HashMap<String, String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: 10,
            max_loss_per_trade: 1_000.0,
            max_abs_delta: 500.0,
            max_abs_theta: 250.0,
            max_per_sector: 3,
            sectors: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sector lookup
// ---------------------------------------------------------------------------

/// Maps a symbol to its sector. `None` means unknown.
pub trait SectorLookup: Send + Sync {
    fn sector(&self, symbol: &str) -> Option<String>;
}

/// Fixed symbol → sector table.
#[derive(Debug, Clone, Default)]
pub struct StaticSectorMap {
    sectors: HashMap<String, String>,
}

impl StaticSectorMap {
    pub fn new(sectors: HashMap<String, String>) -> Self {
        let sectors = sectors
            .into_iter()
            .map(|(symbol, sector)| (symbol.to_uppercase(), sector))
            .collect();
        Self { sectors }
    }
}

impl SectorLookup for StaticSectorMap {
    fn sector(&self, symbol: &str) -> Option<String> {
        self.sectors.get(&symbol.to_uppercase()).cloned()
    }
}

// ---------------------------------------------------------------------------
// Portfolio state
// ---------------------------------------------------------------------------

/// One open position, one contract per leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub trade_id: Uuid,
    pub symbol: String,
    pub sector: String,
    pub delta: f64,
    pub theta: f64,
    pub max_loss: f64,
    /// Settlement of the nearest leg.
    pub expires_at: DateTime<Utc>,
}

impl OpenPosition {
    fn from_trade(trade: &CandidateTrade, sector: String) -> Self {
        Self {
            trade_id: trade.id,
            symbol: trade.symbol().to_string(),
            sector,
            delta: trade.delta_exposure(),
            theta: trade.theta_exposure(),
            max_loss: trade.risk.max_loss,
            expires_at: trade.expires_at(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Aggregate exposure of all open positions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioState {
    pub positions: Vec<OpenPosition>,
    pub total_delta: f64,
    pub total_theta: f64,
    pub sector_counts: HashMap<String, usize>,
}

impl PortfolioState {
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn sector_count(&self, sector: &str) -> usize {
        self.sector_counts.get(sector).copied().unwrap_or(0)
    }

    fn add(&mut self, position: OpenPosition) {
        self.total_delta += position.delta;
        self.total_theta += position.theta;
        *self.sector_counts.entry(position.sector.clone()).or_insert(0) += 1;
        self.positions.push(position);
    }

    fn remove(&mut self, index: usize) -> OpenPosition {
        let position = self.positions.remove(index);
        self.total_delta -= position.delta;
        self.total_theta -= position.theta;
        if let Some(count) = self.sector_counts.get_mut(&position.sector) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.sector_counts.remove(&position.sector);
            }
        }
        position
    }
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

pub struct PortfolioRiskManager {
    config: RiskConfig,
    sectors: Arc<dyn SectorLookup>,
    state: Mutex<PortfolioState>,
}

impl PortfolioRiskManager {
    pub fn new(config: RiskConfig, sectors: Arc<dyn SectorLookup>) -> Self {
        Self {
            config,
            sectors,
            state: Mutex::new(PortfolioState::default()),
        }
    }

    /// Risk manager whose sector lookup is the static map in `config`.
    pub fn from_config(config: RiskConfig) -> Self {
        let sectors = Arc::new(StaticSectorMap::new(config.sectors.clone()));
        Self::new(config, sectors)
    }

    fn sector_for(&self, symbol: &str) -> String {
        self.sectors
            .sector(symbol)
            .unwrap_or_else(|| UNCLASSIFIED_SECTOR.to_string())
    }

    /// Load positions carried over from earlier cycles. Limits are not
    /// re-checked; positions already past settlement are dropped.
    pub fn seed_positions(&self, positions: impl IntoIterator<Item = OpenPosition>) {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut expired = 0usize;
        for position in positions {
            if position.is_expired(now) {
                expired += 1;
                continue;
            }
            state.add(position);
        }
        info!(
            positions = state.position_count(),
            expired,
            delta = format!("{:.1}", state.total_delta),
            theta = format!("{:.2}", state.total_theta),
            "Portfolio seeded"
        );
    }

    /// Remove the oldest open position on `symbol`, releasing its exposure.
    pub fn close_position(&self, symbol: &str) -> Option<OpenPosition> {
        let mut state = self.state.lock();
        let index = state.positions.iter().position(|p| p.symbol == symbol)?;
        let closed = state.remove(index);
        info!(symbol, trade_id = %closed.trade_id, "Position closed");
        Some(closed)
    }

    /// Drop every position settled by `now`, releasing its exposure.
    pub fn expire_positions(&self, now: DateTime<Utc>) -> Vec<OpenPosition> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        let mut index = 0;
        while index < state.positions.len() {
            if state.positions[index].is_expired(now) {
                expired.push(state.remove(index));
            } else {
                index += 1;
            }
        }
        for position in &expired {
            info!(
                symbol = %position.symbol,
                trade_id = %position.trade_id,
                expired_at = %position.expires_at,
                "Position expired"
            );
        }
        expired
    }

    /// Undo the acceptance of a trade that will not be emitted.
    pub fn release(&self, trade_id: Uuid) -> Option<OpenPosition> {
        let mut state = self.state.lock();
        let index = state.positions.iter().position(|p| p.trade_id == trade_id)?;
        let released = state.remove(index);
        debug!(symbol = %released.symbol, trade_id = %trade_id, "Position released");
        Some(released)
    }

    pub fn snapshot(&self) -> PortfolioState {
        self.state.lock().clone()
    }

    /// Accept or reject `trade`. On accept the portfolio is updated before
    /// the lock is released.
    pub fn evaluate(&self, trade: &CandidateTrade) -> Result<(), ScanError> {
        let sector = self.sector_for(trade.symbol());
        let mut state = self.state.lock();

        if let Err(violation) = self.check(&state, trade, &sector) {
            debug!(symbol = trade.symbol(), reason = %violation, "Risk check failed");
            return Err(ScanError::RiskLimitExceeded {
                symbol: trade.symbol().to_string(),
                violation,
            });
        }

        state.add(OpenPosition::from_trade(trade, sector));
        info!(
            symbol = trade.symbol(),
            score = format!("{:.1}", trade.score),
            positions = state.position_count(),
            delta = format!("{:.1}", state.total_delta),
            theta = format!("{:.2}", state.total_theta),
            "Trade accepted"
        );
        Ok(())
    }

    fn check(
        &self,
        state: &PortfolioState,
        trade: &CandidateTrade,
        sector: &str,
    ) -> Result<(), RiskViolation> {
        let cfg = &self.config;

        if state.position_count() >= cfg.max_positions {
            return Err(RiskViolation::PositionCount {
                open: state.position_count(),
                limit: cfg.max_positions,
            });
        }

        if trade.risk.max_loss > cfg.max_loss_per_trade {
            return Err(RiskViolation::MaxLoss {
                max_loss: trade.risk.max_loss,
                limit: cfg.max_loss_per_trade,
            });
        }

        let projected_delta = state.total_delta + trade.delta_exposure();
        if projected_delta.abs() > cfg.max_abs_delta {
            return Err(RiskViolation::DeltaExposure {
                projected: projected_delta,
                limit: cfg.max_abs_delta,
            });
        }

        let projected_theta = state.total_theta + trade.theta_exposure();
        if projected_theta.abs() > cfg.max_abs_theta {
            return Err(RiskViolation::ThetaExposure {
                projected: projected_theta,
                limit: cfg.max_abs_theta,
            });
        }

        let open_in_sector = state.sector_count(sector);
        if open_in_sector >= cfg.max_per_sector {
            return Err(RiskViolation::SectorConcentration {
                sector: sector.to_string(),
                open: open_in_sector,
                limit: cfg.max_per_sector,
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
