//! Strategy layer: position selection, composite scoring and portfolio
//! risk limits.

pub mod risk;
pub mod scorer;
pub mod selector;
