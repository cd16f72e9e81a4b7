//! Core engine: per-symbol screening and the scan pipeline that drives it.

pub mod options_filter;
pub mod pipeline;
pub mod scanner;
