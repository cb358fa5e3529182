//! Circuit breaker for the exchange REST client
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! requests fail fast. Once `timeout` has elapsed a single trial request is let through
//! (HalfOpen); `success_threshold` consecutive successes close it again and
//! any failure re-opens it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Not thread-safe on its own; the client keeps it behind a mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a request may go out now. May move Open → HalfOpen.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = self.name, "Circuit breaker half-open, probing");
                    self.state = CircuitState::HalfOpen;
                    self.failures = 0;
                    self.successes = 0;
                }
                elapsed
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.successes += 1;
                if self.successes >= self.config.success_threshold {
                    info!(breaker = self.name, "Circuit breaker closed after recovery");
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.opened_at = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    warn!(
                        breaker = self.name,
                        failures = self.failures,
                        "Circuit breaker opened"
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = self.name, "Trial request failed, circuit breaker re-opened");
                self.state = CircuitState::Open;
                self.successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
