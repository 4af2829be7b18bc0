use std::time::Duration;

use proxy_core::ProxyError;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Single-process minimum-inter-request-interval gate (C7). Mutex-serialized;
/// fairness beyond FIFO mutex wake order is not guaranteed (§5 only requires
/// strict FIFO, which `tokio::sync::Mutex` provides).
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        RateLimiter {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Acquires the gate. If no prior request has passed through, admits
    /// immediately. Otherwise, when `wait` is true, sleeps out the shortfall
    /// before admitting; when `wait` is false, rejects with a typed
    /// rate-limit error carrying the remaining wait in seconds.
    pub async fn acquire(&self, wait: bool) -> Result<(), ProxyError> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.interval {
                let shortfall = self.interval - elapsed;
                if !wait {
                    return Err(ProxyError::RateLimited {
                        message: "rate limit interval not yet elapsed".into(),
                        retry_after_secs: Some(shortfall.as_secs().max(1)),
                    });
                }
                tokio::time::sleep(shortfall).await;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_always_admits() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        assert!(limiter.acquire(false).await.is_ok());
    }

    #[tokio::test]
    async fn second_call_within_interval_rejects_when_not_waiting() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        limiter.acquire(false).await.unwrap();
        let err = limiter.acquire(false).await.unwrap_err();
        assert!(matches!(err, ProxyError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn second_call_within_interval_sleeps_when_waiting() {
        let limiter = RateLimiter::new(Duration::from_millis(60));
        limiter.acquire(false).await.unwrap();
        let start = Instant::now();
        limiter.acquire(true).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn zero_interval_never_blocks() {
        let limiter = RateLimiter::new(Duration::from_secs(0));
        limiter.acquire(false).await.unwrap();
        limiter.acquire(false).await.unwrap();
    }

    #[tokio::test]
    async fn call_after_interval_elapses_admits_immediately() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        limiter.acquire(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.acquire(false).await.is_ok());
    }
}
