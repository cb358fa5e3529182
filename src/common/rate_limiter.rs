//! Token bucket rate limiter
//!
//! Permits are consumed on acquire and refilled to the full bucket once per
//! refill interval. Clones share the same bucket.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(capacity: usize, refill_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval,
        }
    }

    /// `requests_per_second` permits refilled every second
    pub fn per_second(requests_per_second: usize) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Wait until a permit is available and consume it
    pub async fn acquire(&self) {
        loop {
            self.refill().await;
            if let Ok(permit) = self.permits.try_acquire() {
                permit.forget();
                return;
            }
            let wait = {
                let last = self.last_refill.lock().await;
                self.refill_interval.saturating_sub(last.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Consume a permit if one is available right now
    pub async fn try_acquire(&self) -> bool {
        self.refill().await;
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        if last.elapsed() >= self.refill_interval {
            let missing = self.capacity.saturating_sub(self.permits.available_permits());
            if missing > 0 {
                self.permits.add_permits(missing);
            }
            *last = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exhaust_then_refuse() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available_permits(), 0);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_refill_after_interval() {
        let limiter = RateLimiter::new(2, Duration::from_millis(30));
        limiter.acquire().await;
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        limiter.acquire().await;
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_clones_share_bucket() {
        let a = RateLimiter::new(3, Duration::from_secs(60));
        let b = a.clone();
        a.acquire().await;
        assert_eq!(b.available_permits(), 2);
    }
}
