//! Market data access used by the scanner and the position monitor

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::binance::BinanceClient;
use crate::{Candle, Symbol, Timeframe};

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Last `limit` closed bars, oldest first
    async fn bars(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>>;

    async fn current_price(&self, symbol: &Symbol) -> Result<f64>;

    /// USDT perpetuals ranked by 24h quote volume
    async fn top_pairs(&self, limit: usize) -> Result<Vec<Symbol>>;
}

pub struct BinanceMarketData {
    client: Arc<BinanceClient>,
}

impl BinanceMarketData {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketData for BinanceMarketData {
    async fn bars(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        // One extra so the still-forming bar can be dropped
        let klines = self
            .client
            .get_klines(symbol.as_str(), timeframe.as_str(), limit + 1)
            .await
            .with_context(|| format!("Failed to fetch {} {} klines", symbol, timeframe))?;

        let now = Utc::now().timestamp_millis();
        let mut bars = Vec::with_capacity(klines.len());
        let mut invalid = 0;
        for kline in klines.into_iter().filter(|k| !k.is_open(now)) {
            match Candle::try_from(kline) {
                Ok(bar) => bars.push(bar),
                Err(e) => {
                    invalid += 1;
                    debug!("[{}] dropping invalid bar: {}", symbol, e);
                }
            }
        }
        if invalid > 0 {
            warn!("[{}] {} invalid bars dropped", symbol, invalid);
        }
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<f64> {
        self.client
            .ticker_price(symbol.as_str())
            .await
            .with_context(|| format!("Failed to fetch {} price", symbol))
    }

    async fn top_pairs(&self, limit: usize) -> Result<Vec<Symbol>> {
        let info = self
            .client
            .exchange_info()
            .await
            .context("Failed to fetch exchange info")?;
        let tradable: std::collections::HashSet<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.quote_asset == "USDT" && s.contract_type == "PERPETUAL")
            .map(|s| s.symbol)
            .collect();

        let mut tickers = self
            .client
            .tickers_24h()
            .await
            .context("Failed to fetch 24h tickers")?;
        tickers.retain(|t| tradable.contains(&t.symbol));
        tickers.sort_by(|a, b| b.quote_volume.total_cmp(&a.quote_volume));

        Ok(tickers
            .into_iter()
            .take(limit)
            .map(|t| Symbol::new(t.symbol))
            .collect())
    }
}
