//! Market data access.
//!
//! Defines the `MarketDataApi` trait for the upstream brokerage API and the
//! resilience layer wrapped around it: TTL caching, circuit breaking, and
//! bounded retries. `anomaly` screens fetched quotes for bad ticks.

pub mod anomaly;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod http;

use async_trait::async_trait;

use crate::types::{OptionContract, PriceBar, Quote};

/// Why a single upstream request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("request rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl UpstreamFailure {
    /// Timeouts, connection problems, throttling and 5xx are worth retrying.
    /// Anything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamFailure::Timeout | UpstreamFailure::Network(_) => true,
            UpstreamFailure::Server { .. } => true,
            UpstreamFailure::Rejected { status, .. } => *status == 429,
            UpstreamFailure::Malformed(_) => false,
        }
    }
}

/// Abstraction over the upstream market-data API.
///
/// Implementations perform exactly one request per call; retries, caching
/// and timeouts are applied by `client::ResilientDataClient`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Latest quote for an equity.
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamFailure>;

    /// Full option chain (calls and puts) for an underlying.
    async fn fetch_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, UpstreamFailure>;

    /// Daily bars, oldest first.
    async fn fetch_price_history(
        &self,
        symbol: &str,
        days: u32,
    ) -> Result<Vec<PriceBar>, UpstreamFailure>;

    /// Name used for logging and breaker identification.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(UpstreamFailure::Timeout.is_transient());
        assert!(UpstreamFailure::Network("reset".into()).is_transient());
        assert!(UpstreamFailure::Server { status: 503 }.is_transient());
        assert!(UpstreamFailure::Rejected {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!UpstreamFailure::Rejected {
            status: 404,
            message: "unknown symbol".into()
        }
        .is_transient());
        assert!(!UpstreamFailure::Malformed("eof".into()).is_transient());
    }
}
