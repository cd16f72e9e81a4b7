use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use optscout::config::AppConfig;
use optscout::data::client::ResilientDataClient;
use optscout::engine::pipeline::{ScanPipeline, SymbolOutcome};
use optscout::strategy::risk::{OpenPosition, PortfolioRiskManager};
use optscout::types::{LegAction, ScanError, Stage, StrategyKind};
use uuid::Uuid;

use crate::mock_market_data::{MockMarketData, SymbolData};

// ---- helpers ----

/// Defaults with a deterministic simulation, no score floor and room for
/// every test symbol in one sector.
fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.analytics.seed = Some(42);
    cfg.analytics.simulations = 2_000;
    cfg.scoring.min_score = 0.0;
    cfg.risk.max_per_sector = 10;
    cfg
}

struct Harness {
    api: Arc<MockMarketData>,
    risk: Arc<PortfolioRiskManager>,
    pipeline: ScanPipeline,
}

fn harness(cfg: &AppConfig, api: MockMarketData) -> Harness {
    let api = Arc::new(api);
    let client = Arc::new(ResilientDataClient::new(
        api.clone(),
        cfg.circuit_breaker.clone(),
        cfg.retry.clone(),
        cfg.cache.clone(),
    ));
    let risk = Arc::new(PortfolioRiskManager::from_config(cfg.risk.clone()));
    let pipeline = ScanPipeline::new(cfg, client, risk.clone()).unwrap();
    Harness {
        api,
        risk,
        pipeline,
    }
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---- tests ----

#[tokio::test(start_paused = true)]
async fn test_failing_symbol_does_not_affect_others() {
    let api = MockMarketData::new([
        ("AAPL", SymbolData::bullish("AAPL", 5_000)),
        ("MSFT", SymbolData::bullish("MSFT", 5_000)),
        ("NVDA", SymbolData::bullish("NVDA", 5_000)),
    ]);
    api.fail("MSFT");
    let cfg = test_config();
    let h = harness(&cfg, api);

    let report = h.pipeline.run(&symbols(&["AAPL", "MSFT", "NVDA"])).await;

    assert_eq!(report.trades.len(), 2);
    assert_eq!(report.accepted(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcome("MSFT"),
        Some(SymbolOutcome::Failed(ScanError::Upstream { attempts: 3, .. }))
    ));
    // Retried up to the configured attempt limit, then given up.
    assert_eq!(h.api.quote_calls_for("MSFT"), cfg.retry.max_attempts as usize);
    assert_eq!(h.risk.snapshot().position_count(), 2);
}

#[tokio::test]
async fn test_price_rejection_skips_downstream_stages() {
    let api = MockMarketData::new([("PENY", SymbolData::penny("PENY"))]);
    let h = harness(&test_config(), api);

    let report = h.pipeline.run(&symbols(&["PENY"])).await;

    match report.outcome("PENY") {
        Some(SymbolOutcome::Rejected(reason)) => {
            assert_eq!(reason.stage, Stage::Scanner);
            assert!(reason.detail.contains("price"));
        }
        other => panic!("expected scanner rejection, got {other:?}"),
    }
    assert_eq!(report.stages.quotes_screened, 1);
    assert_eq!(report.stages.chains_filtered, 0);
    assert_eq!(report.stages.contracts_analyzed, 0);
    assert_eq!(report.stages.trades_scored, 0);
    assert_eq!(report.stages.risk_evaluations, 0);
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.api.chain_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_marks_stalled_symbol_incomplete() {
    let api = MockMarketData::new([
        ("AAPL", SymbolData::bullish("AAPL", 5_000)),
        ("SLOW", SymbolData::bullish("SLOW", 5_000)),
    ]);
    api.stall("SLOW", Duration::from_secs(5));
    let mut cfg = test_config();
    cfg.pipeline.cycle_deadline_secs = 1;
    let h = harness(&cfg, api);

    let report = h.pipeline.run(&symbols(&["AAPL", "SLOW"])).await;

    assert!(matches!(report.outcome("SLOW"), Some(SymbolOutcome::Incomplete)));
    assert!(matches!(report.outcome("AAPL"), Some(SymbolOutcome::Accepted { .. })));
    assert_eq!(report.incomplete(), 1);
    assert_eq!(report.trades.len(), 1);
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_trades_ranked_and_truncated() {
    // Open interest drives the liquidity component, so scores order
    // HIGH > MID > LOW with everything else equal.
    let api = MockMarketData::new([
        ("LOW", SymbolData::bullish("LOW", 1_000)),
        ("HIGH", SymbolData::bullish("HIGH", 5_000)),
        ("MID", SymbolData::bullish("MID", 3_000)),
    ]);
    let mut cfg = test_config();
    cfg.pipeline.max_trades = 2;
    let h = harness(&cfg, api);

    let report = h.pipeline.run(&symbols(&["LOW", "HIGH", "MID"])).await;

    let order: Vec<&str> = report.trades.iter().map(|t| t.symbol()).collect();
    assert_eq!(order, vec!["HIGH", "MID"]);
    assert!(report.trades[0].score > report.trades[1].score);

    match report.outcome("LOW") {
        Some(SymbolOutcome::Rejected(reason)) => assert_eq!(reason.stage, Stage::Scorer),
        other => panic!("expected LOW to be cut, got {other:?}"),
    }

    // The cut trade gave its risk budget back.
    let state = h.risk.snapshot();
    assert_eq!(state.position_count(), 2);
    assert!(state.positions.iter().all(|p| p.symbol != "LOW"));
}

#[tokio::test]
async fn test_duplicate_symbols_processed_once() {
    let api = MockMarketData::new([("AAPL", SymbolData::bullish("AAPL", 5_000))]);
    let h = harness(&test_config(), api);

    let report = h.pipeline.run(&symbols(&["AAPL", "aapl", " AAPL "])).await;

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.trades.len(), 1);
    assert_eq!(h.api.quote_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_run_served_from_cache() {
    let api = MockMarketData::new([("AAPL", SymbolData::bullish("AAPL", 5_000))]);
    let mut cfg = test_config();
    cfg.risk.max_positions = 1;
    let h = harness(&cfg, api);

    let first = h.pipeline.run(&symbols(&["AAPL"])).await;
    assert_eq!(first.accepted(), 1);

    // Same data again, but the portfolio is now full.
    let second = h.pipeline.run(&symbols(&["AAPL"])).await;
    match second.outcome("AAPL") {
        Some(SymbolOutcome::Rejected(reason)) => assert_eq!(reason.stage, Stage::Risk),
        other => panic!("expected risk rejection, got {other:?}"),
    }
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.chain_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_config_fails_before_any_symbol() {
    let api = Arc::new(MockMarketData::new([(
        "AAPL",
        SymbolData::bullish("AAPL", 5_000),
    )]));
    let mut cfg = test_config();
    cfg.scoring.weights.probability = 0.9;

    let client = Arc::new(ResilientDataClient::new(
        api.clone(),
        cfg.circuit_breaker.clone(),
        cfg.retry.clone(),
        cfg.cache.clone(),
    ));
    let risk = Arc::new(PortfolioRiskManager::from_config(cfg.risk.clone()));

    let result = ScanPipeline::new(&cfg, client, risk);
    assert!(matches!(result, Err(ScanError::Configuration(_))));
    assert_eq!(api.quote_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_fast_on_next_run() {
    let api = MockMarketData::new([("MSFT", SymbolData::bullish("MSFT", 5_000))]);
    api.fail("MSFT");
    let mut cfg = test_config();
    cfg.circuit_breaker.failure_threshold = 3;
    let h = harness(&cfg, api);

    // Three failed attempts trip the breaker.
    let first = h.pipeline.run(&symbols(&["MSFT"])).await;
    assert!(matches!(
        first.outcome("MSFT"),
        Some(SymbolOutcome::Failed(ScanError::Upstream { attempts: 3, .. }))
    ));
    assert_eq!(h.api.quote_calls_for("MSFT"), 3);

    let second = h.pipeline.run(&symbols(&["MSFT"])).await;
    match second.outcome("MSFT") {
        Some(SymbolOutcome::Failed(ScanError::DataUnavailable { symbol, endpoint, .. })) => {
            assert_eq!(symbol, "MSFT");
            assert_eq!(*endpoint, "quotes");
        }
        other => panic!("expected open breaker, got {other:?}"),
    }
    assert!(second.trades.is_empty());
    assert_eq!(second.stages.quotes_screened, 0);
    // No request reached the upstream while the breaker was open.
    assert_eq!(h.api.quote_calls_for("MSFT"), 3);
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.api.chain_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.risk.snapshot().position_count(), 0);
}

#[tokio::test]
async fn test_quote_aging_out_before_risk_gate_fails_symbol() {
    let api = MockMarketData::new([("AAPL", SymbolData::bullish("AAPL", 5_000))]);
    // Fresh on arrival with a 60s window, stale once the chain answers.
    api.set_quote_age("AAPL", chrono::Duration::seconds(59));
    api.delay_chain("AAPL", Duration::from_millis(1_500));
    let h = harness(&test_config(), api);

    let report = h.pipeline.run(&symbols(&["AAPL"])).await;

    match report.outcome("AAPL") {
        Some(SymbolOutcome::Failed(ScanError::Validation { symbol, reason })) => {
            assert_eq!(symbol, "AAPL");
            assert!(reason.contains("stale"), "{reason}");
        }
        other => panic!("expected stale quote failure, got {other:?}"),
    }
    assert!(report.trades.is_empty());
    assert_eq!(report.accepted(), 0);
    assert_eq!(report.stages.trades_scored, 1);
    assert_eq!(report.stages.risk_evaluations, 0);
    assert_eq!(h.risk.snapshot().position_count(), 0);
}

#[tokio::test]
async fn test_breakout_opens_call_debit_spread() {
    let api = MockMarketData::new([("AMD", SymbolData::breakout("AMD"))]);
    let h = harness(&test_config(), api);

    let report = h.pipeline.run(&symbols(&["AMD"])).await;

    assert_eq!(report.trades.len(), 1, "{:?}", report.outcome("AMD"));
    assert_eq!(report.stages.strategies_selected, 1);
    let trade = &report.trades[0];
    assert_eq!(trade.strategy, StrategyKind::CallDebitSpread);
    assert_eq!(trade.legs.len(), 2);
    assert_eq!(trade.legs[0].action, LegAction::Buy);
    assert_eq!(trade.legs[0].contract.strike, 102.0);
    assert_eq!(trade.legs[1].action, LegAction::Sell);
    assert_eq!(trade.legs[1].contract.strike, 107.0);

    // Debit of 1.22 - 0.04 on a 5-wide spread.
    assert!((trade.risk.max_loss - 118.0).abs() < 1e-6);
    assert!((trade.risk.max_gain - 382.0).abs() < 1e-6);
    assert!((h.risk.snapshot().positions[0].max_loss - 118.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_expired_position_frees_its_slot() {
    let api = MockMarketData::new([("AAPL", SymbolData::bullish("AAPL", 5_000))]);
    let mut cfg = test_config();
    cfg.risk.max_positions = 1;
    let h = harness(&cfg, api);

    h.risk.seed_positions([OpenPosition {
        trade_id: Uuid::new_v4(),
        symbol: "XOM".into(),
        sector: "Energy".into(),
        delta: 40.0,
        theta: -5.0,
        max_loss: 150.0,
        expires_at: chrono::Utc::now() + chrono::Duration::milliseconds(200),
    }]);
    assert_eq!(h.risk.snapshot().position_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = h.pipeline.run(&symbols(&["AAPL"])).await;

    assert!(matches!(report.outcome("AAPL"), Some(SymbolOutcome::Accepted { .. })));
    let state = h.risk.snapshot();
    assert_eq!(state.position_count(), 1);
    assert_eq!(state.positions[0].symbol, "AAPL");
}
