//! Mock market data for integration testing.
//!
//! Provides a deterministic `MarketDataApi` implementation serving
//! canned quotes, bars and chains from memory. Individual symbols can be
//! made to fail, stall, serve aged quotes or answer chain requests slowly,
//! and every call is counted.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use optscout::data::{MarketDataApi, UpstreamFailure};
use optscout::types::{OptionContract, OptionType, PriceBar, Quote};

/// Canned data for one symbol.
#[derive(Clone)]
pub struct SymbolData {
    pub price: f64,
    pub quote_volume: u64,
    pub bars: Vec<PriceBar>,
    pub chain: Vec<OptionContract>,
}

fn call(symbol: &str, strike: f64, bid: f64, ask: f64, open_interest: u64) -> OptionContract {
    OptionContract {
        underlying: symbol.to_string(),
        strike,
        dte: 3,
        option_type: OptionType::Call,
        bid,
        ask,
        open_interest,
        volume: 1_000,
        implied_volatility: 0.30,
    }
}

impl SymbolData {
    /// A strong bullish symbol: 30 flat bars at 100 (ATR 4.0, 2M volume)
    /// and a quote at 102 on 5M volume. The chain holds one liquid 3-DTE
    /// call with `open_interest`, which the selector buys outright.
    pub fn bullish(symbol: &str, open_interest: u64) -> Self {
        let bars = (0..30)
            .map(|i| PriceBar {
                open: 100.0,
                high: 102.0,
                low: 98.0,
                close: 100.0,
                volume: 2_000_000,
                timestamp: Utc::now() - Duration::days(30 - i),
            })
            .collect();
        Self {
            price: 102.0,
            quote_volume: 5_000_000,
            bars,
            chain: vec![call(symbol, 103.0, 1.00, 1.02, open_interest)],
        }
    }

    /// Bullish on 3M volume, below the strong-momentum ratio, so the
    /// selector opens a call debit spread: long the 102 call (delta
    /// nearest 0.50) and short the 107 call five points out.
    pub fn breakout(symbol: &str) -> Self {
        Self {
            quote_volume: 3_000_000,
            chain: vec![
                call(symbol, 100.0, 2.60, 2.64, 5_000),
                call(symbol, 102.0, 1.20, 1.22, 5_000),
                call(symbol, 104.0, 0.50, 0.51, 5_000),
                call(symbol, 107.0, 0.040, 0.041, 5_000),
                call(symbol, 110.0, 0.010, 0.0102, 5_000),
            ],
            ..Self::bullish(symbol, 5_000)
        }
    }

    /// Same as `bullish` but priced below the scanner's floor.
    pub fn penny(symbol: &str) -> Self {
        Self {
            price: 4.0,
            ..Self::bullish(symbol, 5_000)
        }
    }
}

/// In-memory market data with per-endpoint call counters.
pub struct MockMarketData {
    data: HashMap<String, SymbolData>,
    failing: Mutex<HashSet<String>>,
    /// Symbols whose quote requests never complete in time.
    stalled: Mutex<HashMap<String, std::time::Duration>>,
    quote_age: Mutex<HashMap<String, Duration>>,
    chain_delay: Mutex<HashMap<String, std::time::Duration>>,
    pub quote_calls: AtomicUsize,
    pub chain_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    per_symbol_quotes: Mutex<HashMap<String, usize>>,
}

impl MockMarketData {
    pub fn new(data: impl IntoIterator<Item = (&'static str, SymbolData)>) -> Self {
        Self {
            data: data
                .into_iter()
                .map(|(s, d)| (s.to_string(), d))
                .collect(),
            failing: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashMap::new()),
            quote_age: Mutex::new(HashMap::new()),
            chain_delay: Mutex::new(HashMap::new()),
            quote_calls: AtomicUsize::new(0),
            chain_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            per_symbol_quotes: Mutex::new(HashMap::new()),
        }
    }

    /// Every request for `symbol` fails with HTTP 503.
    pub fn fail(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }

    /// Quote requests for `symbol` take `delay` to answer.
    pub fn stall(&self, symbol: &str, delay: std::time::Duration) {
        self.stalled.lock().insert(symbol.to_string(), delay);
    }

    /// Quotes for `symbol` are stamped `age` in the past.
    pub fn set_quote_age(&self, symbol: &str, age: Duration) {
        self.quote_age.lock().insert(symbol.to_string(), age);
    }

    /// Chain requests for `symbol` take `delay` to answer.
    pub fn delay_chain(&self, symbol: &str, delay: std::time::Duration) {
        self.chain_delay.lock().insert(symbol.to_string(), delay);
    }

    pub fn quote_calls_for(&self, symbol: &str) -> usize {
        self.per_symbol_quotes.lock().get(symbol).copied().unwrap_or(0)
    }

    fn lookup(&self, symbol: &str) -> Result<&SymbolData, UpstreamFailure> {
        if self.failing.lock().contains(symbol) {
            return Err(UpstreamFailure::Server { status: 503 });
        }
        self.data.get(symbol).ok_or_else(|| UpstreamFailure::Rejected {
            status: 404,
            message: format!("unknown symbol {symbol}"),
        })
    }
}

#[async_trait]
impl MarketDataApi for MockMarketData {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamFailure> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_symbol_quotes
            .lock()
            .entry(symbol.to_string())
            .or_default() += 1;

        let delay = self.stalled.lock().get(symbol).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = self.lookup(symbol)?;
        let age = self.quote_age.lock().get(symbol).copied().unwrap_or_else(Duration::zero);
        Ok(Quote {
            symbol: symbol.to_string(),
            price: data.price,
            bid: data.price - 0.01,
            ask: data.price + 0.01,
            volume: data.quote_volume,
            timestamp: Utc::now() - age,
        })
    }

    async fn fetch_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, UpstreamFailure> {
        self.chain_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.chain_delay.lock().get(symbol).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.lookup(symbol)?.chain.clone())
    }

    async fn fetch_price_history(
        &self,
        symbol: &str,
        _days: u32,
    ) -> Result<Vec<PriceBar>, UpstreamFailure> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookup(symbol)?.bars.clone())
    }

    fn name(&self) -> &str {
        "mock-market-data"
    }
}
