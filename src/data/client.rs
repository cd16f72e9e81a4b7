//! Resilient market-data client.
//!
//! Every upstream call is gated by the API's circuit breaker, bounded by a
//! per-request timeout, and retried with capped exponential backoff plus
//! jitter. Successful responses are cached per endpoint TTL.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache::{CacheConfig, Staleness, TtlCache};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use super::{MarketDataApi, UpstreamFailure};
use crate::types::{OptionContract, PriceBar, Quote, ScanError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per logical request, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Up to this fraction of the backoff delay is added as random jitter.
    pub jitter_ratio: f64,
    pub request_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter_ratio: 0.2,
            request_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff before `attempt` (1-based), without jitter. Zero for the first.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if base.is_zero() || ratio == 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=ratio);
        base + base.mul_f64(jitter)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Market data access with caching, retries and circuit breaking.
pub struct ResilientDataClient {
    api: Arc<dyn MarketDataApi>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    cache_config: CacheConfig,
    quotes: TtlCache<String, Quote>,
    chains: TtlCache<String, Vec<OptionContract>>,
    history: TtlCache<String, Vec<PriceBar>>,
}

impl ResilientDataClient {
    pub fn new(
        api: Arc<dyn MarketDataApi>,
        breaker_config: CircuitBreakerConfig,
        retry: RetryConfig,
        cache_config: CacheConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(api.name().to_string(), breaker_config);
        Self {
            api,
            breaker,
            retry,
            cache_config,
            quotes: TtlCache::new("quotes"),
            chains: TtlCache::new("chains"),
            history: TtlCache::new("history"),
        }
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Oldest a quote may be and still be acted on.
    pub fn freshness_window(&self) -> Duration {
        self.cache_config.freshness_window()
    }

    /// Latest quote for `symbol`. Served from cache only while both the
    /// cache TTL and the quote's own freshness window hold.
    pub async fn get_quote(&self, symbol: &str) -> Result<Arc<Quote>, ScanError> {
        let window = self.cache_config.freshness_window();
        if let Some(cached) = self.quotes.get(symbol) {
            if cached.is_fresh(window) {
                debug!(symbol, "Quote cache hit");
                return Ok(cached);
            }
            debug!(symbol, age_secs = cached.age().num_seconds(), "Cached quote stale, refetching");
        }

        let quote = self
            .call_upstream("quotes", symbol, || self.api.fetch_quote(symbol))
            .await?;

        quote.validate()?;
        if quote.symbol != symbol {
            return Err(ScanError::Validation {
                symbol: symbol.to_string(),
                reason: format!("upstream returned quote for {}", quote.symbol),
            });
        }
        if !quote.is_fresh(window) {
            return Err(ScanError::Validation {
                symbol: symbol.to_string(),
                reason: format!(
                    "quote is {}s old (limit {}s)",
                    quote.age().num_seconds(),
                    window.as_secs()
                ),
            });
        }

        Ok(self
            .quotes
            .set(symbol.to_string(), quote, self.cache_config.quote_ttl()))
    }

    /// Option chain for `symbol`, cached for the chain TTL.
    pub async fn get_option_chain(
        &self,
        symbol: &str,
    ) -> Result<Arc<Vec<OptionContract>>, ScanError> {
        if let Some(cached) = self.chains.get(symbol) {
            debug!(symbol, contracts = cached.len(), "Chain cache hit");
            return Ok(cached);
        }

        let chain = self
            .call_upstream("chains", symbol, || self.api.fetch_chain(symbol))
            .await?;

        Ok(self
            .chains
            .set(symbol.to_string(), chain, self.cache_config.chain_ttl()))
    }

    /// Daily bars for `symbol`, oldest first, cached for the history TTL.
    pub async fn get_price_history(&self, symbol: &str) -> Result<Arc<Vec<PriceBar>>, ScanError> {
        if let Some(cached) = self.history.get(symbol) {
            debug!(symbol, bars = cached.len(), "History cache hit");
            return Ok(cached);
        }

        let days = self.cache_config.history_days;
        let mut bars = self
            .call_upstream("history", symbol, || {
                self.api.fetch_price_history(symbol, days)
            })
            .await?;
        bars.sort_by_key(|bar| bar.timestamp);

        Ok(self
            .history
            .set(symbol.to_string(), bars, self.cache_config.history_ttl()))
    }

    /// Last cached quote regardless of TTL, for display when upstream is
    /// down. Never fed into scoring.
    pub fn last_known_quote(&self, symbol: &str) -> Option<Staleness<Quote>> {
        self.quotes.get_stale(symbol)
    }

    /// Drop expired entries from every cache. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let removed =
            self.quotes.clear_expired() + self.chains.clear_expired() + self.history.clear_expired();
        if removed > 0 {
            info!(removed, "Swept expired market data");
        }
        removed
    }

    /// Run one logical request with breaker gating, timeouts and retries.
    async fn call_upstream<T, F, Fut>(
        &self,
        endpoint: &'static str,
        symbol: &str,
        mut request: F,
    ) -> Result<T, ScanError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_with_jitter(attempt);
                debug!(
                    symbol,
                    endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying upstream call"
                );
                tokio::time::sleep(delay).await;
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    warn!(symbol, endpoint, retry_in = ?open.retry_in, "Circuit open, skipping upstream call");
                    return Err(ScanError::DataUnavailable {
                        symbol: symbol.to_string(),
                        endpoint,
                        retry_in: open.retry_in,
                    });
                }
            };

            let outcome = match tokio::time::timeout(self.retry.request_timeout(), request()).await
            {
                Ok(result) => result,
                Err(_) => Err(UpstreamFailure::Timeout),
            };

            match outcome {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(failure) if failure.is_transient() => {
                    permit.failure();
                    warn!(symbol, endpoint, attempt, max_attempts, error = %failure, "Upstream call failed");
                    last_error = failure.to_string();
                }
                Err(failure) => {
                    // The upstream answered; it just refused this request.
                    permit.success();
                    warn!(symbol, endpoint, attempt, error = %failure, "Upstream rejected request, not retrying");
                    return Err(ScanError::Upstream {
                        symbol: symbol.to_string(),
                        endpoint,
                        attempts: attempt,
                        last_error: failure.to_string(),
                    });
                }
            }
        }

        Err(ScanError::Upstream {
            symbol: symbol.to_string(),
            endpoint,
            attempts: max_attempts,
            last_error,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::circuit_breaker::CircuitState;
    use crate::data::MockMarketDataApi;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ---- helpers ----

    fn quote(symbol: &str, age_secs: i64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price: 100.0,
            bid: 99.95,
            ask: 100.05,
            volume: 2_000_000,
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    /// Fails the first `fail_first` quote calls with `failure`, then succeeds.
    struct FlakyApi {
        calls: AtomicU32,
        fail_first: u32,
        failure: UpstreamFailure,
        quote_age_secs: i64,
    }

    impl FlakyApi {
        fn new(fail_first: u32, failure: UpstreamFailure) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                failure,
                quote_age_secs: 0,
            }
        }

        fn healthy() -> Self {
            Self::new(0, UpstreamFailure::Timeout)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataApi for FlakyApi {
        async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(self.failure.clone());
            }
            Ok(quote(symbol, self.quote_age_secs))
        }

        async fn fetch_chain(&self, _symbol: &str) -> Result<Vec<OptionContract>, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn fetch_price_history(
            &self,
            _symbol: &str,
            _days: u32,
        ) -> Result<Vec<PriceBar>, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.2,
            request_timeout_ms: 1_000,
        }
    }

    fn lenient_breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default().failure_threshold(100)
    }

    fn client_with(
        api: Arc<dyn MarketDataApi>,
        breaker: CircuitBreakerConfig,
        retry: RetryConfig,
    ) -> ResilientDataClient {
        ResilientDataClient::new(api, breaker, retry, CacheConfig::default())
    }

    // ---- backoff ----

    #[test]
    fn test_backoff_schedule_is_capped() {
        let retry = RetryConfig {
            base_delay_ms: 250,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert_eq!(retry.backoff_for(1), Duration::ZERO);
        assert_eq!(retry.backoff_for(2), Duration::from_millis(250));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(500));
        assert_eq!(retry.backoff_for(4), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let retry = RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_ratio: 0.2,
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let d = retry.delay_with_jitter(2);
            assert!(d >= Duration::from_millis(1_000));
            assert!(d <= Duration::from_millis(1_200));
        }
    }

    // ---- caching ----

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cached_quote_skips_upstream() {
        let api = Arc::new(FlakyApi::healthy());
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        let first = client.get_quote("AAPL").await.unwrap();
        let second = client.get_quote("AAPL").await.unwrap();

        assert_eq!(api.calls(), 1);
        assert_eq!(first.price, second.price);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quote_refetched_after_ttl() {
        let api = Arc::new(FlakyApi::healthy());
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        client.get_quote("AAPL").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        client.get_quote("AAPL").await.unwrap();

        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_quote_past_freshness_window_is_a_miss() {
        let api = Arc::new(FlakyApi::healthy());
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        // Within cache TTL, but the quote itself is 2 minutes old.
        client
            .quotes
            .set("AAPL".to_string(), quote("AAPL", 120), Duration::from_secs(60));
        let fetched = client.get_quote("AAPL").await.unwrap();

        assert_eq!(api.calls(), 1);
        assert!(fetched.is_fresh(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_upstream_quote_is_rejected_and_not_cached() {
        let api = Arc::new(FlakyApi {
            quote_age_secs: 300,
            ..FlakyApi::healthy()
        });
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        let err = client.get_quote("AAPL").await.unwrap_err();
        assert!(matches!(err, ScanError::Validation { .. }));
        assert!(client.last_known_quote("AAPL").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_known_quote_marks_expiry() {
        let api = Arc::new(FlakyApi::healthy());
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        client.get_quote("AAPL").await.unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;

        let stale = client.last_known_quote("AAPL").unwrap();
        assert!(stale.expired);
        assert_eq!(stale.age, Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired_clears_all_caches() {
        let api = Arc::new(FlakyApi::healthy());
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        client.get_quote("AAPL").await.unwrap();
        client.get_option_chain("AAPL").await.unwrap();
        client.get_price_history("AAPL").await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        // Quote and chain expired; history lives for an hour.
        assert_eq!(client.sweep_expired(), 2);
        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert_eq!(client.sweep_expired(), 1);
    }

    // ---- retries ----

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let api = Arc::new(FlakyApi::new(2, UpstreamFailure::Server { status: 503 }));
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(3));

        let quote = client.get_quote("AAPL").await.unwrap();
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exactly_max_attempts() {
        let api = Arc::new(FlakyApi::new(u32::MAX, UpstreamFailure::Timeout));
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(4));

        let err = client.get_quote("AAPL").await.unwrap_err();
        match err {
            ScanError::Upstream { attempts, endpoint, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(endpoint, "quotes");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(api.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_is_not_retried() {
        let api = Arc::new(FlakyApi::new(
            u32::MAX,
            UpstreamFailure::Rejected {
                status: 404,
                message: "unknown symbol".into(),
            },
        ));
        let client = client_with(api.clone(), lenient_breaker(), fast_retry(4));

        let err = client.get_quote("ZZZZ").await.unwrap_err();
        assert!(matches!(err, ScanError::Upstream { attempts: 1, .. }));
        assert_eq!(api.calls(), 1);
        assert_eq!(client.breaker_stats().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        struct SlowApi;

        #[async_trait]
        impl MarketDataApi for SlowApi {
            async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamFailure> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(quote(symbol, 0))
            }
            async fn fetch_chain(&self, _: &str) -> Result<Vec<OptionContract>, UpstreamFailure> {
                Ok(Vec::new())
            }
            async fn fetch_price_history(
                &self,
                _: &str,
                _: u32,
            ) -> Result<Vec<PriceBar>, UpstreamFailure> {
                Ok(Vec::new())
            }
            fn name(&self) -> &str {
                "slow"
            }
        }

        let client = client_with(Arc::new(SlowApi), lenient_breaker(), fast_retry(2));
        let err = client.get_quote("AAPL").await.unwrap_err();
        match err {
            ScanError::Upstream { attempts, last_error, .. } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // ---- circuit breaking ----

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_reaches_upstream() {
        let mut mock = MockMarketDataApi::new();
        mock.expect_name().return_const("mock".to_string());
        // Exactly the two attempts that trip the breaker; nothing afterwards.
        mock.expect_fetch_quote()
            .times(2)
            .returning(|_| Err(UpstreamFailure::Server { status: 502 }));

        let breaker = CircuitBreakerConfig::default()
            .failure_threshold(2)
            .cooldown_secs(30);
        let client = client_with(Arc::new(mock), breaker, fast_retry(2));

        let first = client.get_quote("AAPL").await.unwrap_err();
        assert!(matches!(first, ScanError::Upstream { attempts: 2, .. }));
        assert_eq!(client.breaker_stats().state, CircuitState::Open);

        let second = client.get_quote("MSFT").await.unwrap_err();
        match second {
            ScanError::DataUnavailable { retry_in, endpoint, .. } => {
                assert_eq!(endpoint, "quotes");
                assert!(retry_in > Duration::ZERO);
                assert!(retry_in <= Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_recovers_after_cooldown() {
        let api = Arc::new(FlakyApi::new(2, UpstreamFailure::Network("reset".into())));
        let breaker = CircuitBreakerConfig::default()
            .failure_threshold(2)
            .cooldown_secs(30);
        let client = client_with(api.clone(), breaker, fast_retry(2));

        assert!(client.get_quote("AAPL").await.is_err());
        assert!(matches!(
            client.get_quote("AAPL").await,
            Err(ScanError::DataUnavailable { .. })
        ));

        tokio::time::advance(Duration::from_secs(31)).await;
        let quote = client.get_quote("AAPL").await.unwrap();
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(client.breaker_stats().state, CircuitState::Closed);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_hit_needs_no_upstream() {
        let mut mock = MockMarketDataApi::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_fetch_chain().times(0);

        let client = client_with(Arc::new(mock), lenient_breaker(), fast_retry(3));
        client
            .chains
            .set("AAPL".to_string(), Vec::new(), Duration::from_secs(300));

        let chain = client.get_option_chain("AAPL").await.unwrap();
        assert!(chain.is_empty());
    }
}
