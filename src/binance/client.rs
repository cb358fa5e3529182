//! Binance USDⓈ-M futures REST client
//!
//! Public market data needs no credentials. Signed endpoints (orders,
//! balances, leverage) require an API key and secret.
//!
//! Every request goes through a client-side rate limiter and a circuit
//! breaker. Idempotent GETs are retried with backoff on transient errors;
//! order placement and cancellation are single attempts here and retried by
//! the caller where that is safe.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::{encode_params, Credentials};
use super::types::{
    ApiError, AssetBalance, BinanceKline, ExchangeInfo, FuturesOrder, Ticker24h, TickerPrice,
    UserTrade,
};
use crate::common::{
    retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RetryPolicy,
};
use crate::config::ExchangeConfig;
use crate::error::BackendError;

/// Maximum klines per request (Binance limit)
const MAX_KLINES_PER_REQUEST: usize = 1500;

#[derive(Debug)]
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    limiter: RateLimiter,
    breaker: Mutex<CircuitBreaker>,
    retry: RetryPolicy,
}

impl BinanceClient {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let credentials = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) => Some(Credentials::new(key.clone(), secret.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            limiter: RateLimiter::per_second(config.rate_limit),
            breaker: Mutex::new(CircuitBreaker::new(
                "binance",
                CircuitBreakerConfig::default()
                    .with_failure_threshold(5)
                    .with_timeout(Duration::from_secs(30)),
            )),
            retry: RetryPolicy::default()
                .with_max_attempts(config.max_retries + 1)
                .with_initial_backoff(Duration::from_millis(500)),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Single request, no retries
    async fn request<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, BackendError>
    where
        T: DeserializeOwned + Send,
    {
        let allowed = self.breaker().can_attempt();
        if !allowed {
            return Err(BackendError::CircuitOpen);
        }
        self.limiter.acquire().await;

        let mut query = encode_params(params);
        if signed {
            let creds = self.credentials.as_ref().ok_or_else(|| {
                BackendError::Rejected("API key and secret required for signed endpoint".into())
            })?;
            let stamp = format!(
                "recvWindow={}&timestamp={}",
                self.recv_window_ms,
                chrono::Utc::now().timestamp_millis()
            );
            query = if query.is_empty() { stamp } else { format!("{}&{}", query, stamp) };
            query = creds.signed_query(&query);
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!("{} {}", method, path);

        let mut builder = self.http.request(method, &url);
        if let Some(creds) = &self.credentials {
            builder = builder.header("X-MBX-APIKEY", creds.api_key());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker().record_failure();
                return Err(e.into());
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            self.breaker().record_failure();
            warn!("Binance rate limit hit on {}", path);
            return Err(BackendError::RateLimited);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.breaker().record_failure();
                return Err(e.into());
            }
        };

        if status.is_server_error() {
            self.breaker().record_failure();
            return Err(BackendError::Network(format!("HTTP {}: {}", status, body)));
        }
        // The venue answered; business errors do not count against the breaker
        self.breaker().record_success();

        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiError>(&body) {
                Ok(api) => BackendError::Exchange {
                    code: api.code,
                    message: api.msg,
                },
                Err(_) => BackendError::Network(format!("HTTP {}: {}", status, body)),
            });
        }

        serde_json::from_str(&body).map_err(|e| BackendError::Decode(format!("{}: {}", path, e)))
    }

    /// GET with retries on transient failures
    async fn get<T>(
        &self,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, BackendError>
    where
        T: DeserializeOwned + Send,
    {
        retry_with_backoff(&self.retry, path, BackendError::is_retryable, || {
            self.request(Method::GET, path, params, signed)
        })
        .await
    }

    /// Most recent `limit` klines, oldest first
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<BinanceKline>, BackendError> {
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let raw: Vec<Vec<serde_json::Value>> = self
            .get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;

        Ok(raw.iter().filter_map(|row| BinanceKline::from_raw(row)).collect())
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, BackendError> {
        let ticker: TickerPrice = self
            .get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())], false)
            .await?;
        Ok(ticker.price)
    }

    pub async fn tickers_24h(&self) -> Result<Vec<Ticker24h>, BackendError> {
        self.get("/fapi/v1/ticker/24hr", &[], false).await
    }

    pub async fn exchange_info(&self) -> Result<ExchangeInfo, BackendError> {
        self.get("/fapi/v1/exchangeInfo", &[], false).await
    }

    pub async fn place_order(&self, params: &[(&str, String)]) -> Result<FuturesOrder, BackendError> {
        self.request(Method::POST, "/fapi/v1/order", params, true).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<FuturesOrder, BackendError> {
        self.request(
            Method::DELETE,
            "/fapi/v1/order",
            &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            true,
        )
        .await
    }

    pub async fn query_order(&self, symbol: &str, order_id: i64) -> Result<FuturesOrder, BackendError> {
        self.get(
            "/fapi/v1/order",
            &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            true,
        )
        .await
    }

    pub async fn order_trades(&self, symbol: &str, order_id: i64) -> Result<Vec<UserTrade>, BackendError> {
        self.get(
            "/fapi/v1/userTrades",
            &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            true,
        )
        .await
    }

    pub async fn balances(&self) -> Result<Vec<AssetBalance>, BackendError> {
        self.get("/fapi/v2/balance", &[], true).await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BackendError> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/leverage",
                &[("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
                true,
            )
            .await?;
        Ok(())
    }
}
