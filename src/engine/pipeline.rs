//! Scan pipeline: one run over a symbol universe.
//!
//! Each symbol runs the full stage sequence on a bounded worker pool:
//!
//! ```text
//! quote ─▶ screen ─▶ history ─▶ anomaly ─▶ scan ─▶ chain ─▶ filter ─▶ greeks
//!       ─▶ strategy ─▶ position analytics ─▶ score ─▶ (deadline, freshness) ─▶ risk
//! ```
//!
//! A symbol's failure or rejection is recorded in the `RunReport` and never
//! affects other symbols. Symbols still running at the cycle deadline are
//! abandoned and reported as incomplete. A quote that ages past the
//! freshness window while the later stages run fails the symbol before it
//! reaches the risk gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analytics::Analytics;
use crate::config::AppConfig;
use crate::data::anomaly::AnomalyDetector;
use crate::data::client::ResilientDataClient;
use crate::engine::options_filter::OptionsFilter;
use crate::engine::scanner::Scanner;
use crate::storage::TradeSink;
use crate::strategy::risk::PortfolioRiskManager;
use crate::strategy::scorer::Scorer;
use crate::strategy::selector::StrategySelector;
use crate::types::{CandidateTrade, RejectReason, ScanError, Stage};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent symbols in flight.
    pub workers: usize,
    /// Wall-clock budget for one run.
    pub cycle_deadline_secs: u64,
    /// Trades emitted per run, best scores first.
    pub max_trades: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cycle_deadline_secs: 120,
            max_trades: 5,
        }
    }
}

impl PipelineConfig {
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// What happened to one symbol.
#[derive(Debug, Clone)]
pub enum SymbolOutcome {
    /// Passed every stage; the trade is in `RunReport::trades`.
    Accepted { trade_id: Uuid, score: f64 },
    /// A stage declined the symbol.
    Rejected(RejectReason),
    /// Data could not be obtained or validated.
    Failed(ScanError),
    /// The worker panicked.
    Aborted(String),
    /// Still in flight at the cycle deadline.
    Incomplete,
}

impl SymbolOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolOutcome::Accepted { .. } => "accepted",
            SymbolOutcome::Rejected(_) => "rejected",
            SymbolOutcome::Failed(_) => "failed",
            SymbolOutcome::Aborted(_) => "aborted",
            SymbolOutcome::Incomplete => "incomplete",
        }
    }
}

/// How many times each stage ran during a run.
#[derive(Debug, Default)]
struct StageCounters {
    quotes_screened: AtomicUsize,
    chains_filtered: AtomicUsize,
    contracts_analyzed: AtomicUsize,
    strategies_selected: AtomicUsize,
    trades_scored: AtomicUsize,
    risk_evaluations: AtomicUsize,
}

impl StageCounters {
    fn bump(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageCounts {
        StageCounts {
            quotes_screened: self.quotes_screened.load(Ordering::Relaxed),
            chains_filtered: self.chains_filtered.load(Ordering::Relaxed),
            contracts_analyzed: self.contracts_analyzed.load(Ordering::Relaxed),
            strategies_selected: self.strategies_selected.load(Ordering::Relaxed),
            trades_scored: self.trades_scored.load(Ordering::Relaxed),
            risk_evaluations: self.risk_evaluations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub quotes_screened: usize,
    pub chains_filtered: usize,
    pub contracts_analyzed: usize,
    pub strategies_selected: usize,
    pub trades_scored: usize,
    pub risk_evaluations: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Accepted trades, best score first, at most `max_trades`.
    pub trades: Vec<CandidateTrade>,
    /// One entry per distinct symbol, in universe order.
    pub outcomes: Vec<(String, SymbolOutcome)>,
    pub stages: StageCounts,
    pub persisted: bool,
}

impl RunReport {
    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, o)| o)
    }

    fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.label() == label).count()
    }

    pub fn accepted(&self) -> usize {
        self.count("accepted")
    }

    pub fn rejected(&self) -> usize {
        self.count("rejected")
    }

    pub fn failed(&self) -> usize {
        self.count("failed") + self.count("aborted")
    }

    pub fn incomplete(&self) -> usize {
        self.count("incomplete")
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Stages shared by every worker task.
struct Stages {
    client: Arc<ResilientDataClient>,
    anomaly: AnomalyDetector,
    scanner: Scanner,
    filter: OptionsFilter,
    analytics: Analytics,
    selector: StrategySelector,
    scorer: Scorer,
    risk: Arc<PortfolioRiskManager>,
}

pub struct ScanPipeline {
    stages: Arc<Stages>,
    config: PipelineConfig,
    sink: Option<Arc<dyn TradeSink>>,
}

impl ScanPipeline {
    /// Build the pipeline. Fails before any symbol is processed if the
    /// configuration is invalid.
    pub fn new(
        config: &AppConfig,
        client: Arc<ResilientDataClient>,
        risk: Arc<PortfolioRiskManager>,
    ) -> Result<Self, ScanError> {
        config.validate()?;

        let stages = Stages {
            client,
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            scanner: Scanner::new(config.scanner.clone()),
            filter: OptionsFilter::new(config.options.clone()),
            analytics: Analytics::new(config.analytics.clone()),
            selector: StrategySelector::new(config.strategy.clone()),
            scorer: Scorer::new(config.scoring.clone())?,
            risk,
        };

        Ok(Self {
            stages: Arc::new(stages),
            config: config.pipeline.clone(),
            sink: None,
        })
    }

    /// Persist accepted trades through `sink` at the end of every run.
    pub fn with_sink(mut self, sink: Arc<dyn TradeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn risk(&self) -> &Arc<PortfolioRiskManager> {
        &self.stages.risk
    }

    /// Process `symbols` once and report the outcome of each.
    pub async fn run(&self, symbols: &[String]) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.config.cycle_deadline();

        let mut seen = HashSet::new();
        let universe: Vec<String> = symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();

        info!(
            run_id = %run_id,
            symbols = universe.len(),
            workers = self.config.workers,
            deadline_secs = self.config.cycle_deadline_secs,
            "Scan run starting"
        );

        self.stages.client.sweep_expired();
        self.stages.risk.expire_positions(started_at);

        let counters = Arc::new(StageCounters::default());
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));

        let handles: Vec<_> = universe
            .iter()
            .map(|symbol| {
                let stages = Arc::clone(&self.stages);
                let counters = Arc::clone(&counters);
                let permits = Arc::clone(&permits);
                let symbol = symbol.clone();
                tokio::spawn(async move {
                    let work = async {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return Err(SymbolOutcome::Incomplete);
                        };
                        stages.process(&symbol, &counters, deadline).await
                    };
                    tokio::select! {
                        // A finished symbol wins over an elapsed deadline.
                        biased;
                        result = work => result,
                        _ = tokio::time::sleep_until(deadline) => Err(SymbolOutcome::Incomplete),
                    }
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;

        let mut trades = Vec::new();
        let mut outcomes = Vec::with_capacity(universe.len());
        for (symbol, joined) in universe.into_iter().zip(results) {
            let outcome = match joined {
                Ok(Ok(trade)) => {
                    let outcome = SymbolOutcome::Accepted {
                        trade_id: trade.id,
                        score: trade.score,
                    };
                    trades.push(trade);
                    outcome
                }
                Ok(Err(outcome)) => outcome,
                Err(join_err) => {
                    error!(symbol = %symbol, error = %join_err, "Symbol worker aborted");
                    SymbolOutcome::Aborted(join_err.to_string())
                }
            };
            outcomes.push((symbol, outcome));
        }

        let trades = self.rank(trades, &mut outcomes);

        let persisted = match &self.sink {
            Some(sink) => match sink.persist_batch(run_id, &trades).await {
                Ok(()) => true,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Failed to persist trades");
                    false
                }
            },
            None => false,
        };

        let report = RunReport {
            run_id,
            started_at,
            elapsed: started.elapsed(),
            trades,
            outcomes,
            stages: counters.snapshot(),
            persisted,
        };

        info!(
            run_id = %run_id,
            accepted = report.accepted(),
            rejected = report.rejected(),
            failed = report.failed(),
            incomplete = report.incomplete(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scan run complete"
        );

        report
    }

    /// Sort by score and keep the top `max_trades`. Trades cut here give
    /// their risk budget back.
    fn rank(
        &self,
        mut trades: Vec<CandidateTrade>,
        outcomes: &mut [(String, SymbolOutcome)],
    ) -> Vec<CandidateTrade> {
        trades.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let limit = self.config.max_trades;
        if trades.len() > limit {
            for cut in trades.split_off(limit) {
                self.stages.risk.release(cut.id);
                let reason = RejectReason::new(
                    Stage::Scorer,
                    format!("score {:.1} outside top {limit}", cut.score),
                );
                debug!(symbol = cut.symbol(), reason = %reason, "Trade cut");
                let slot = outcomes.iter_mut().find(|(s, _)| s.as_str() == cut.symbol());
                if let Some((_, outcome)) = slot {
                    *outcome = SymbolOutcome::Rejected(reason);
                }
            }
        }
        trades
    }
}

impl Stages {
    /// Run every stage for one symbol.
    async fn process(
        &self,
        symbol: &str,
        counters: &StageCounters,
        deadline: Instant,
    ) -> Result<CandidateTrade, SymbolOutcome> {
        let rejected = |reason: RejectReason| {
            debug!(symbol, reason = %reason, "Symbol rejected");
            SymbolOutcome::Rejected(reason)
        };

        let quote = self
            .client
            .get_quote(symbol)
            .await
            .map_err(|e| self.failed(symbol, e))?;

        StageCounters::bump(&counters.quotes_screened, 1);
        self.scanner.screen_quote(&quote).map_err(rejected)?;

        let history = self
            .client
            .get_price_history(symbol)
            .await
            .map_err(|e| self.failed(symbol, e))?;
        self.anomaly
            .check(&quote, &history)
            .map_err(|e| self.failed(symbol, e))?;
        let candidate = self.scanner.scan(&quote, &history).map_err(rejected)?;

        let chain = self
            .client
            .get_option_chain(symbol)
            .await
            .map_err(|e| self.failed(symbol, e))?;

        StageCounters::bump(&counters.chains_filtered, 1);
        let contracts = self.filter.filter(&candidate, &chain).map_err(rejected)?;

        StageCounters::bump(&counters.contracts_analyzed, contracts.len());
        let analyzed = self
            .analytics
            .analyze_all(&quote, &contracts)
            .map_err(rejected)?;

        StageCounters::bump(&counters.strategies_selected, 1);
        let plan = self.selector.select(&candidate, &analyzed).map_err(rejected)?;
        let position = self.analytics.evaluate(&quote, plan).map_err(rejected)?;

        StageCounters::bump(&counters.trades_scored, 1);
        let trade = self.scorer.score(&candidate, position).map_err(rejected)?;

        if Instant::now() >= deadline {
            return Err(SymbolOutcome::Incomplete);
        }

        // The quote was fresh when fetched; the history and chain fetches
        // since may have aged it past the window.
        let window = self.client.freshness_window();
        if !quote.is_fresh(window) {
            return Err(self.failed(
                symbol,
                ScanError::Validation {
                    symbol: symbol.to_string(),
                    reason: format!(
                        "quote went stale before the risk gate ({}s old, limit {}s)",
                        quote.age().num_seconds(),
                        window.as_secs()
                    ),
                },
            ));
        }

        // Nothing awaits past this point, so an accepted trade is always
        // reported.
        StageCounters::bump(&counters.risk_evaluations, 1);
        match self.risk.evaluate(&trade) {
            Ok(()) => Ok(trade),
            Err(ScanError::RiskLimitExceeded { violation, .. }) => Err(rejected(
                RejectReason::new(Stage::Risk, violation.to_string()),
            )),
            Err(e) => Err(self.failed(symbol, e)),
        }
    }

    fn failed(&self, symbol: &str, error: ScanError) -> SymbolOutcome {
        if let ScanError::DataUnavailable { .. } = error {
            match self.client.last_known_quote(symbol) {
                Some(stale) => warn!(
                    symbol,
                    last_price = format!("${:.2}", stale.value.price),
                    age_secs = stale.age.as_secs(),
                    expired = stale.expired,
                    "Upstream unavailable; last known quote is stale, skipping"
                ),
                None => warn!(symbol, error = %error, "Upstream unavailable, skipping"),
            }
        } else {
            warn!(symbol, error = %error, "Symbol failed");
        }
        SymbolOutcome::Failed(error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
