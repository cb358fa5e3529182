//! Binance USDⓈ-M futures REST types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Candle, CandleValidationError};

/// Binance kline/candlestick data
/// API returns an array: [open_time, open, high, low, close, volume, close_time,
///                        quote_volume, trades, taker_buy_base, taker_buy_quote, ignore]
#[derive(Debug, Clone)]
pub struct BinanceKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl BinanceKline {
    /// Parse from raw JSON array returned by Binance API
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 7 {
            return None;
        }

        Some(BinanceKline {
            open_time: raw[0].as_i64()?,
            open: raw[1].as_str()?.parse().ok()?,
            high: raw[2].as_str()?.parse().ok()?,
            low: raw[3].as_str()?.parse().ok()?,
            close: raw[4].as_str()?.parse().ok()?,
            volume: raw[5].as_str()?.parse().ok()?,
            close_time: raw[6].as_i64()?,
        })
    }

    /// Still forming at `now_ms`
    pub fn is_open(&self, now_ms: i64) -> bool {
        self.close_time >= now_ms
    }
}

impl TryFrom<BinanceKline> for Candle {
    type Error = CandleValidationError;

    fn try_from(k: BinanceKline) -> Result<Self, Self::Error> {
        Candle::new(
            DateTime::from_timestamp_millis(k.open_time).unwrap_or_else(Utc::now),
            k.open,
            k.high,
            k.low,
            k.close,
            k.volume,
        )
    }
}

/// Binance sends most numbers as strings
fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(f64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse().map_err(serde::de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub last_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub contract_type: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

/// Price/quantity increments and minimum notional of a contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

impl SymbolRules {
    pub fn from_info(info: &SymbolInfo) -> Self {
        let mut rules = SymbolRules::default();
        for filter in &info.filters {
            let value = |key: &str| {
                filter
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("PRICE_FILTER") => rules.tick_size = value("tickSize"),
                Some("LOT_SIZE") => rules.step_size = value("stepSize"),
                Some("MIN_NOTIONAL") => rules.min_notional = value("notional"),
                _ => {}
            }
        }
        rules
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }

    /// Quantities are floored so the notional never exceeds the sizing
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        if self.step_size <= 0.0 {
            return quantity;
        }
        let steps = (quantity / self.step_size + 1e-9).floor();
        trim(steps * self.step_size, self.step_size)
    }
}

fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    trim((value / step).round() * step, step)
}

/// Drop float noise beyond the step's decimals
fn trim(value: f64, step: f64) -> f64 {
    let decimals = (-step.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Futures order as returned by place/query endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesOrder {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    #[serde(default, deserialize_with = "de_str_f64")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "de_str_f64")]
    pub executed_qty: f64,
    #[serde(default)]
    pub update_time: i64,
}

impl FuturesOrder {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    /// No longer working on the book
    pub fn is_closed(&self) -> bool {
        matches!(
            self.status.as_str(),
            "FILLED" | "CANCELED" | "EXPIRED" | "REJECTED"
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub balance: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub available_balance: f64,
}

/// Error body `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

/// Commission attached to a trade of an order
#[derive(Debug, Clone, Deserialize)]
pub struct UserTrade {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    #[serde(deserialize_with = "de_str_f64")]
    pub commission: f64,
}
