//! End-to-end tests: the scan pipeline over in-memory market data.

mod mock_market_data;
mod pipeline;
