//! Persistence layer.
//!
//! Accepted trades are appended to a JSON-lines file, one object per trade
//! tagged with the run that produced it. The open-position ledger is saved
//! as a single JSON document so the risk manager can be re-seeded on start.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::strategy::risk::OpenPosition;
use crate::types::CandidateTrade;

/// Default ledger file path.
const DEFAULT_POSITIONS_FILE: &str = "optscout_positions.json";

// ---------------------------------------------------------------------------
// Trade sink
// ---------------------------------------------------------------------------

/// Receives the accepted trades of each run, once per run.
#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn persist_batch(&self, run_id: Uuid, trades: &[CandidateTrade]) -> Result<()>;
}

#[derive(Serialize)]
struct TradeRecord<'a> {
    run_id: Uuid,
    #[serde(flatten)]
    trade: &'a CandidateTrade,
}

/// Appends trades to a JSON-lines file.
pub struct JsonlTradeSink {
    path: PathBuf,
}

impl JsonlTradeSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TradeSink for JsonlTradeSink {
    async fn persist_batch(&self, run_id: Uuid, trades: &[CandidateTrade]) -> Result<()> {
        if trades.is_empty() {
            debug!(run_id = %run_id, "No trades to persist");
            return Ok(());
        }

        let mut buf = String::new();
        for trade in trades {
            let line = serde_json::to_string(&TradeRecord { run_id, trade })
                .context("Failed to serialise trade")?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;

        info!(
            run_id = %run_id,
            trades = trades.len(),
            path = %self.path.display(),
            "Trades persisted"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Position ledger
// ---------------------------------------------------------------------------

/// Save open positions to a JSON file.
pub fn save_positions(positions: &[OpenPosition], path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_POSITIONS_FILE);
    let json =
        serde_json::to_string_pretty(positions).context("Failed to serialise positions")?;

    std::fs::write(path, &json).context(format!("Failed to write positions to {path}"))?;

    debug!(path, positions = positions.len(), "Positions saved");
    Ok(())
}

/// Load open positions from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_positions(path: Option<&str>) -> Result<Option<Vec<OpenPosition>>> {
    let path = path.unwrap_or(DEFAULT_POSITIONS_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved positions found, starting flat");
        return Ok(None);
    }

    let json =
        std::fs::read_to_string(path).context(format!("Failed to read positions from {path}"))?;
    let positions: Vec<OpenPosition> =
        serde_json::from_str(&json).context(format!("Failed to parse positions from {path}"))?;

    info!(path, positions = positions.len(), "Positions loaded from disk");
    Ok(Some(positions))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
