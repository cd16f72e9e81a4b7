//! HTTPS market-data API.
//!
//! Thin reqwest adapter: one request per call, JSON → domain types, HTTP
//! status → `UpstreamFailure`. Retries and caching live in
//! `ResilientDataClient`.
//!
//! Endpoints (relative to `base_url`):
//! - `GET /v1/quotes/{symbol}`
//! - `GET /v1/chains/{symbol}`
//! - `GET /v1/history/{symbol}?days={n}`

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{MarketDataApi, UpstreamFailure};
use crate::config::AppConfig;
use crate::types::{OptionContract, OptionType, PriceBar, Quote};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Longest error body kept in a `Rejected` failure.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Identifies the API in logs and names its circuit breaker.
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the bearer token. Reads work without one.
    pub token_env: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            name: "market-data".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            token_env: None,
            connect_timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQuote {
    symbol: String,
    last: f64,
    bid: f64,
    ask: f64,
    #[serde(default)]
    volume: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChain {
    underlying: String,
    #[serde(default)]
    contracts: Vec<WireContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContract {
    strike: f64,
    dte: u32,
    #[serde(rename = "type")]
    option_type: OptionType,
    bid: f64,
    ask: f64,
    #[serde(default)]
    open_interest: u64,
    #[serde(default)]
    volume: u64,
    /// Annualised, as a fraction.
    implied_volatility: f64,
}

#[derive(Debug, Deserialize)]
struct WireHistory {
    #[serde(default)]
    bars: Vec<WireBar>,
}

#[derive(Debug, Deserialize)]
struct WireBar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: u64,
    timestamp: DateTime<Utc>,
}

impl From<WireQuote> for Quote {
    fn from(w: WireQuote) -> Self {
        Quote {
            symbol: w.symbol,
            price: w.last,
            bid: w.bid,
            ask: w.ask,
            volume: w.volume,
            timestamp: w.timestamp,
        }
    }
}

impl From<WireBar> for PriceBar {
    fn from(w: WireBar) -> Self {
        PriceBar {
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.volume,
            timestamp: w.timestamp,
        }
    }
}

impl WireChain {
    fn into_contracts(self) -> Vec<OptionContract> {
        let underlying = self.underlying;
        self.contracts
            .into_iter()
            .map(|c| OptionContract {
                underlying: underlying.clone(),
                strike: c.strike,
                dte: c.dte,
                option_type: c.option_type,
                bid: c.bid,
                ask: c.ask,
                open_interest: c.open_interest,
                volume: c.volume,
                implied_volatility: c.implied_volatility,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpMarketData {
    http: Client,
    name: String,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpMarketData {
    pub fn new(config: &ApiConfig, token: Option<SecretString>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("optscout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for market data")?;

        Ok(Self {
            http,
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from config, resolving the bearer token from the environment.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let token = match &config.token_env {
            Some(var) => Some(SecretString::new(AppConfig::resolve_env(var)?)),
            None => None,
        };
        Self::new(config, token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamFailure> {
        let url = format!("{}{}", self.base_url, path);
        debug!(api = %self.name, url = %url, "Market data request");

        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body = response.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&body).map_err(|e| UpstreamFailure::Malformed(e.to_string()))
    }
}

fn classify_transport(err: reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::Timeout
    } else {
        UpstreamFailure::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> UpstreamFailure {
    if status.is_server_error() {
        return UpstreamFailure::Server {
            status: status.as_u16(),
        };
    }
    let mut message = body;
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    UpstreamFailure::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl MarketDataApi for HttpMarketData {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamFailure> {
        let wire: WireQuote = self.get_json(&format!("/v1/quotes/{symbol}"), &[]).await?;
        Ok(wire.into())
    }

    async fn fetch_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, UpstreamFailure> {
        let wire: WireChain = self.get_json(&format!("/v1/chains/{symbol}"), &[]).await?;
        Ok(wire.into_contracts())
    }

    async fn fetch_price_history(
        &self,
        symbol: &str,
        days: u32,
    ) -> Result<Vec<PriceBar>, UpstreamFailure> {
        let wire: WireHistory = self
            .get_json(
                &format!("/v1/history/{symbol}"),
                &[("days", days.to_string())],
            )
            .await?;
        Ok(wire.bars.into_iter().map(PriceBar::from).collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
