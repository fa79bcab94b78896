//! Engine configuration
//!
//! Loaded from a TOML file, with environment overrides for the knobs that
//! differ between deployments. Every section has working defaults, so an
//! empty file (or no file at all) yields a runnable engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_PATH: &str = "ENGINE_CONFIG";
pub const ENV_BIND_ADDR: &str = "ENGINE_BIND_ADDR";
pub const ENV_JOURNAL_DIR: &str = "ENGINE_JOURNAL_DIR";
pub const ENV_JWT_SECRET: &str = "ENGINE_JWT_SECRET";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Matching worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// TTL of the `lock:order:{id}` claim
    pub lock_ttl_ms: u64,
    /// TTL of the `tombstone:order:{id}` cancellation marker
    pub tombstone_ttl_ms: u64,
    /// Maximum time an order may wait for its trigger, counted from its
    /// last placement or amendment
    pub max_wait_ms: u64,
    /// Delay before re-evaluating an order whose instrument has no price yet
    pub price_retry_interval_ms: u64,
    /// After this many missing-price retries the order parks on the watchlist
    pub max_price_retries: u32,
    /// Attempts for version-conditioned settlement before giving up
    pub conflict_retries: u32,
    /// Period of the watchlist expiry sweep
    pub sweep_interval_ms: u64,
    /// Delay before re-delivering a job whose order is claimed elsewhere
    pub claim_retry_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 300_000,
            tombstone_ttl_ms: 3_600_000,
            max_wait_ms: 30 * 60 * 1000,
            price_retry_interval_ms: 1_000,
            max_price_retries: 10,
            conflict_retries: 5,
            sweep_interval_ms: 60_000,
            claim_retry_interval_ms: 250,
        }
    }
}

impl WorkerConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    /// Max wait in nanoseconds, for comparison with order timestamps
    pub fn max_wait_nanos(&self) -> i64 {
        (self.max_wait_ms as i64).saturating_mul(1_000_000)
    }

    pub fn price_retry_interval(&self) -> Duration {
        Duration::from_millis(self.price_retry_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn claim_retry_interval(&self) -> Duration {
        Duration::from_millis(self.claim_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Jobs admitted per interval
    pub max: u32,
    pub per_interval_ms: u64,
}

/// Dispatch queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_in_flight: usize,
    pub rate_limit: RateLimitConfig,
    /// Transient failures tolerated before a job is dead-lettered
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            rate_limit: RateLimitConfig {
                max: 200,
                per_interval_ms: 1_000,
            },
            retry_attempts: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 10_000,
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for the given (1-based) attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }
}

/// Trading session calendar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ignore the calendar and treat the market as permanently open
    pub always_open: bool,
    /// Local opening time, `HH:MM`
    pub open: String,
    /// Local closing time, `HH:MM` (exclusive)
    pub close: String,
    /// Offset of exchange local time from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Trading weekdays, e.g. `["Mon", "Tue", "Wed", "Thu", "Fri"]`
    pub trading_days: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            always_open: false,
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            utc_offset_minutes: 330,
            trading_days: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// Journal directory. `None` keeps the ledger in memory only.
    pub dir: Option<PathBuf>,
    pub fsync: bool,
    pub max_file_size_bytes: u64,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dir: None,
            fsync: true,
            max_file_size_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedInstrument {
    pub symbol: String,
    pub seed_price: Decimal,
}

/// Simulated price feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub instruments: Vec<FeedInstrument>,
    pub tick_interval_ms: u64,
    /// Maximum move per tick, in basis points
    pub volatility_bps: u32,
    /// RNG seed, so a simulated session can be replayed
    pub seed: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instruments: Vec::new(),
            tick_interval_ms: 500,
            volatility_bps: 25,
            seed: 7,
            reconnect_backoff_base_ms: 250,
            reconnect_backoff_cap_ms: 30_000,
        }
    }
}

impl FeedConfig {
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.reconnect_backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.reconnect_backoff_cap_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// TTL of the cached `view:portfolio:{user}` entry
    pub portfolio_view_ttl_ms: u64,
    /// Attempts for version-conditioned admission writes
    pub conflict_retries: u32,
    /// How long a cancel waits for an in-flight evaluation to release the
    /// order before giving up
    pub cancel_claim_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            portfolio_view_ttl_ms: 5_000,
            conflict_retries: 8,
            cancel_claim_wait_ms: 2_000,
        }
    }
}

impl AdmissionConfig {
    pub fn cancel_claim_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_claim_wait_ms)
    }
}

/// HTTP gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    /// Sustained per-user request rate
    pub requests_per_second: f64,
    pub burst: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            jwt_secret: "change-me".to_string(),
            requests_per_second: 20.0,
            burst: 40.0,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub journal: JournalSettings,
    pub feed: FeedConfig,
    pub admission: AdmissionConfig,
    pub gateway: GatewayConfig,
}

impl EngineConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `$ENGINE_CONFIG` (defaults when unset), then apply
    /// environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.gateway.bind_addr = addr;
        }
        if let Some(dir) = lookup(ENV_JOURNAL_DIR) {
            self.journal.dir = Some(PathBuf::from(dir));
        }
        if let Some(secret) = lookup(ENV_JWT_SECRET) {
            self.gateway.jwt_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_in_flight == 0 {
            return Err(ConfigError::Invalid("queue.max_in_flight must be > 0".into()));
        }
        if self.queue.rate_limit.max == 0 || self.queue.rate_limit.per_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.rate_limit needs max > 0 and per_interval_ms > 0".into(),
            ));
        }
        if self.worker.lock_ttl_ms == 0 {
            return Err(ConfigError::Invalid("worker.lock_ttl_ms must be > 0".into()));
        }
        if self.worker.conflict_retries == 0 || self.admission.conflict_retries == 0 {
            return Err(ConfigError::Invalid("conflict_retries must be > 0".into()));
        }
        if self.feed.enabled && self.feed.instruments.is_empty() {
            return Err(ConfigError::Invalid(
                "feed.enabled requires at least one instrument".into(),
            ));
        }
        for instrument in &self.feed.instruments {
            if instrument.seed_price <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "feed instrument {} needs a positive seed_price",
                    instrument.symbol
                )));
            }
        }
        if self.gateway.requests_per_second <= 0.0 || self.gateway.burst < 1.0 {
            return Err(ConfigError::Invalid(
                "gateway rate limit needs requests_per_second > 0 and burst >= 1".into(),
            ));
        }
        crate::session::MarketSession::from_config(&self.session)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker.lock_ttl(), Duration::from_secs(300));
        assert_eq!(config.worker.max_wait_nanos(), 30 * 60 * 1_000_000_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [worker]
            max_wait_ms = 1000

            [queue.rate_limit]
            max = 5
            per_interval_ms = 100

            [session]
            always_open = true

            [[feed.instruments]]
            symbol = "RELIANCE"
            seed_price = "2500.50"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.max_wait_ms, 1000);
        assert_eq!(config.worker.lock_ttl_ms, 300_000);
        assert_eq!(config.queue.rate_limit.max, 5);
        assert_eq!(config.queue.max_in_flight, 32);
        assert!(config.session.always_open);
        assert_eq!(config.feed.instruments[0].seed_price, Decimal::new(250050, 2));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = EngineConfig::from_toml_str("[queue]\nmax_in_flight = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_session_time() {
        let err = EngineConfig::from_toml_str("[session]\nopen = \"25:00\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BIND_ADDR, "127.0.0.1:9000"),
            (ENV_JOURNAL_DIR, "/var/lib/engine"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.journal.dir, Some(PathBuf::from("/var/lib/engine")));
        assert_eq!(config.gateway.jwt_secret, "change-me");
    }

    #[test]
    fn test_backoff_is_capped() {
        let queue = QueueConfig::default();
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(2), Duration::from_millis(200));
        assert_eq!(queue.backoff(30), Duration::from_millis(10_000));
    }
}
