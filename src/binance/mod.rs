//! Binance USDⓈ-M futures REST access: market data, orders and account

pub mod auth;
mod client;
mod types;

pub use client::BinanceClient;
pub use types::*;
