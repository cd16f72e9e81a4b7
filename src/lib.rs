//! OPTSCOUT: short-dated options scanner.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod analytics;
pub mod config;
pub mod data;
pub mod engine;
pub mod storage;
pub mod strategy;
pub mod types;
