//! OPTSCOUT: short-dated options scanner.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the open-position ledger from disk, and runs the scan pipeline
//! on a fixed interval with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use optscout::config;
use optscout::data::client::ResilientDataClient;
use optscout::data::http::HttpMarketData;
use optscout::engine::pipeline::{RunReport, ScanPipeline, SymbolOutcome};
use optscout::storage::{self, JsonlTradeSink};
use optscout::strategy::risk::PortfolioRiskManager;

const BANNER: &str = r#"
  ___  ____ _____ ____   ____ ___  _   _ _____
 / _ \|  _ \_   _/ ___| / ___/ _ \| | | |_   _|
| | | | |_) || | \___ \| |  | | | | | | | | |
| |_| |  __/ | |  ___) | |__| |_| | |_| | | |
 \___/|_|    |_| |____/ \____\___/ \___/  |_|

  Short-dated options scanner
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        scan_interval_secs = cfg.agent.scan_interval_secs,
        symbols = cfg.agent.universe.len(),
        api = %cfg.api.base_url,
        "OPTSCOUT starting up"
    );

    if cfg.agent.universe.is_empty() {
        warn!("Universe is empty; every cycle will be a no-op");
    }

    // -- Initialise components -------------------------------------------

    let api = HttpMarketData::from_config(&cfg.api)?;
    let client = Arc::new(ResilientDataClient::new(
        Arc::new(api),
        cfg.circuit_breaker.clone(),
        cfg.retry.clone(),
        cfg.cache.clone(),
    ));

    let risk = Arc::new(PortfolioRiskManager::from_config(cfg.risk.clone()));
    match storage::load_positions(Some(&cfg.agent.positions_path))? {
        Some(positions) => risk.seed_positions(positions),
        None => info!("Fresh start, no open positions"),
    }

    let pipeline = ScanPipeline::new(&cfg, client.clone(), risk.clone())
        .context("Invalid configuration")?
        .with_sink(Arc::new(JsonlTradeSink::new(&cfg.agent.trades_path)));

    // -- Main loop -------------------------------------------------------

    let scan_interval = Duration::from_secs(cfg.agent.scan_interval_secs);
    let mut interval = tokio::time::interval(scan_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.scan_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    let mut cycles = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                cycles += 1;
                info!(cycle = cycles, "Starting cycle");

                let report = pipeline.run(&cfg.agent.universe).await;
                log_run_report(&report);

                let breaker = client.breaker_stats();
                if breaker.trips > 0 {
                    info!(
                        breaker = %breaker.name,
                        state = ?breaker.state,
                        trips = breaker.trips,
                        "Circuit breaker status"
                    );
                }

                let positions = risk.snapshot().positions;
                if let Err(e) = storage::save_positions(&positions, Some(&cfg.agent.positions_path)) {
                    error!(error = %e, "Failed to save positions");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let state = risk.snapshot();
    storage::save_positions(&state.positions, Some(&cfg.agent.positions_path))?;
    info!(
        cycles,
        positions = state.position_count(),
        delta = format!("{:.1}", state.total_delta),
        theta = format!("{:.2}", state.total_theta),
        "OPTSCOUT shut down cleanly."
    );

    Ok(())
}

/// Log a human-readable run summary and the emitted trades.
fn log_run_report(report: &RunReport) {
    for trade in &report.trades {
        info!(
            symbol = trade.symbol(),
            strategy = %trade.strategy,
            legs = %trade.legs_summary(),
            score = format!("{:.1}", trade.score),
            pop = format!("{:.1}%", trade.probability.probability_of_profit * 100.0),
            max_loss = format!("${:.2}", trade.risk.max_loss),
            "Trade candidate"
        );
    }

    for (symbol, outcome) in &report.outcomes {
        if let SymbolOutcome::Failed(e) = outcome {
            warn!(symbol = %symbol, error = %e, "Symbol failed");
        }
    }

    info!(
        run_id = %report.run_id,
        trades = report.trades.len(),
        accepted = report.accepted(),
        rejected = report.rejected(),
        failed = report.failed(),
        incomplete = report.incomplete(),
        screened = report.stages.quotes_screened,
        analyzed = report.stages.contracts_analyzed,
        strategies = report.stages.strategies_selected,
        persisted = report.persisted,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Cycle complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("optscout=info"));

    let json_logging = std::env::var("OPTSCOUT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
