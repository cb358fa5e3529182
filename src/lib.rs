//! Fibonacci retracement short engine
//!
//! Detects the latest High→Low swing of each perpetual contract, classifies
//! where price has retraced into one of four cases and manages the resulting
//! short position (linked entries, dynamic take profit, stop loss) through a
//! paper or live Binance futures backend.

pub mod backend;
pub mod binance;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod market;
pub mod metrics;
pub mod notify;
pub mod oms;
pub mod state_manager;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use types::*;
