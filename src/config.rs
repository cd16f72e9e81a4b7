//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section is optional; missing keys take their defaults. Secrets (the
//! market-data token) are referenced by env-var name in the config and
//! resolved at runtime.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::analytics::AnalyticsConfig;
use crate::data::anomaly::AnomalyConfig;
use crate::data::cache::CacheConfig;
use crate::data::circuit_breaker::CircuitBreakerConfig;
use crate::data::client::RetryConfig;
use crate::data::http::ApiConfig;
use crate::engine::options_filter::OptionsFilterConfig;
use crate::engine::pipeline::PipelineConfig;
use crate::engine::scanner::ScannerConfig;
use crate::strategy::risk::RiskConfig;
use crate::strategy::scorer::ScoringConfig;
use crate::strategy::selector::SelectorConfig;
use crate::types::ScanError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub scanner: ScannerConfig,
    pub anomaly: AnomalyConfig,
    pub options: OptionsFilterConfig,
    pub analytics: AnalyticsConfig,
    pub strategy: SelectorConfig,
    pub scoring: ScoringConfig,
    pub risk: RiskConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub scan_interval_secs: u64,
    /// Symbols scanned every cycle.
    pub universe: Vec<String>,
    /// JSON-lines file receiving accepted trades.
    pub trades_path: String,
    /// Open-position ledger, reloaded on start.
    pub positions_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "OPTSCOUT-001".into(),
            scan_interval_secs: 300,
            universe: Vec::new(),
            trades_path: "optscout_trades.jsonl".into(),
            positions_path: "optscout_positions.json".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ScanError> {
        self.scoring.weights.validate()?;

        let checks: Vec<(bool, String)> = vec![
            (
                self.scanner.min_price < self.scanner.max_price,
                format!(
                    "scanner.min_price ({}) must be below scanner.max_price ({})",
                    self.scanner.min_price, self.scanner.max_price
                ),
            ),
            positive("scanner.min_avg_volume", self.scanner.min_avg_volume),
            non_negative("scanner.max_spread_pct", self.scanner.max_spread_pct),
            non_negative("options.max_spread_pct", self.options.max_spread_pct),
            (
                self.options.min_dte <= self.options.max_dte,
                format!(
                    "options.min_dte ({}) exceeds options.max_dte ({})",
                    self.options.min_dte, self.options.max_dte
                ),
            ),
            (self.pipeline.workers > 0, "pipeline.workers must be positive".into()),
            (
                self.pipeline.cycle_deadline_secs > 0,
                "pipeline.cycle_deadline_secs must be positive".into(),
            ),
            (self.pipeline.max_trades > 0, "pipeline.max_trades must be positive".into()),
            (self.retry.max_attempts > 0, "retry.max_attempts must be positive".into()),
            (
                (0.0..=1.0).contains(&self.retry.jitter_ratio),
                format!("retry.jitter_ratio ({}) must be within 0..=1", self.retry.jitter_ratio),
            ),
            (
                self.circuit_breaker.failure_threshold > 0,
                "circuit_breaker.failure_threshold must be positive".into(),
            ),
            (
                self.analytics.simulations > 0,
                "analytics.simulations must be positive".into(),
            ),
            positive("anomaly.max_move", self.anomaly.max_move),
            positive("anomaly.max_z_score", self.anomaly.max_z_score),
            non_negative("anomaly.flat_tolerance", self.anomaly.flat_tolerance),
            positive("strategy.spread_width", self.strategy.spread_width),
            (
                (0.0..=100.0).contains(&self.scoring.min_score),
                format!("scoring.min_score ({}) must be within 0..=100", self.scoring.min_score),
            ),
            positive("risk.max_loss_per_trade", self.risk.max_loss_per_trade),
            positive("risk.max_abs_delta", self.risk.max_abs_delta),
            positive("risk.max_abs_theta", self.risk.max_abs_theta),
        ];

        match checks.into_iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ScanError::Configuration(message)),
            None => Ok(()),
        }
    }
}

/// NaN fails every comparison, so these also reject it.
fn positive(name: &str, value: f64) -> (bool, String) {
    (value > 0.0, format!("{name} ({value}) must be positive"))
}

fn non_negative(name: &str, value: f64) -> (bool, String) {
    (value >= 0.0, format!("{name} ({value}) must not be negative"))
}
