//! Resilience utilities shared by the exchange client and the order workers
//!
//! - Circuit breaker for fault tolerance
//! - Rate limiter using a token bucket
//! - Retry with exponential backoff

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::{retry_with_backoff, RetryPolicy};
