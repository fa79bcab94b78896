use crate::error::AppError;
use dashmap::DashMap;
use std::time::Instant;

#[derive(Clone)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn allow_request(&mut self, tokens: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = f64::min(self.capacity, self.tokens + elapsed * self.refill_rate);
        self.last_update = now;

        // Consume token
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false // Rate limited
        }
    }
}

/// Per-key token buckets, keyed e.g. by `"{user_id}:{endpoint}"`.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    burst: f64,
    per_second: f64,
}

impl RateLimiter {
    pub fn new(burst: f64, per_second: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst,
            per_second,
        }
    }

    pub fn check_rate_limit(&self, key: &str) -> Result<(), AppError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.burst, self.per_second));

        if bucket.allow_request(1.0) {
            Ok(())
        } else {
            tracing::debug!(%key, "Rate limited");
            Err(AppError::RateLimitExceeded(format!("Rate limit for {}", key)))
        }
    }
}
