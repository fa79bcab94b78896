use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

struct Bucket {
    capacity: f64,
    tokens: f64,
    /// Tokens per second
    refill_rate: f64,
    last_update: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = f64::min(self.capacity, self.tokens + elapsed * self.refill_rate);
        self.last_update = now;
    }
}

/// Token bucket admitting `max` jobs per `per_interval_ms`.
pub struct JobRateLimiter {
    bucket: Mutex<Bucket>,
}

impl JobRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.max.max(1) as f64;
        let interval_secs = Duration::from_millis(config.per_interval_ms.max(1)).as_secs_f64();
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_rate: capacity / interval_secs,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, otherwise report how long until one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / bucket.refill_rate))
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let limiter = JobRateLimiter::new(RateLimitConfig {
            max: 3,
            per_interval_ms: 1_000,
        });
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
        }
        let wait = limiter.try_acquire().unwrap_err();
        assert!(wait > Duration::from_millis(300) && wait <= Duration::from_millis(334));

        tokio::time::advance(Duration::from_millis(340)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = JobRateLimiter::new(RateLimitConfig {
            max: 1,
            per_interval_ms: 500,
        });
        limiter.acquire().await;

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(499));
    }
}
