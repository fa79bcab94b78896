//! Market session calendar and clocks

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use types::errors::EngineError;

use crate::config::SessionConfig;

/// Source of "now" in Unix nanoseconds.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        types::unix_nanos()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_nanos: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_nanos),
        })
    }

    pub fn set(&self, nanos: i64) {
        self.now.store(nanos, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now.fetch_add(secs * 1_000_000_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Trading hours in exchange-local time.
#[derive(Debug, Clone)]
pub struct MarketSession {
    always_open: bool,
    open: NaiveTime,
    close: NaiveTime,
    offset: FixedOffset,
    trading_days: Vec<Weekday>,
}

impl MarketSession {
    pub fn from_config(config: &SessionConfig) -> Result<Self, EngineError> {
        let parse_time = |label: &str, raw: &str| {
            NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| {
                EngineError::Validation(format!("session.{} {:?}: {}", label, raw, e))
            })
        };
        let open = parse_time("open", &config.open)?;
        let close = parse_time("close", &config.close)?;
        if !config.always_open && open >= close {
            return Err(EngineError::Validation(format!(
                "session opens at {} but closes at {}",
                open, close
            )));
        }

        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            EngineError::Validation(format!(
                "utc_offset_minutes out of range: {}",
                config.utc_offset_minutes
            ))
        })?;

        let trading_days = config
            .trading_days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| EngineError::Validation(format!("unknown weekday {:?}", d)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            always_open: config.always_open,
            open,
            close,
            offset,
            trading_days,
        })
    }

    /// A session that never closes.
    pub fn always_open() -> Self {
        Self {
            always_open: true,
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            offset: Utc.fix(),
            trading_days: Vec::new(),
        }
    }

    /// Whether the market is open at `now_nanos` (Unix nanoseconds).
    pub fn is_open(&self, now_nanos: i64) -> bool {
        if self.always_open {
            return true;
        }
        let local: DateTime<FixedOffset> =
            DateTime::from_timestamp_nanos(now_nanos).with_timezone(&self.offset);
        if !self.trading_days.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        time >= self.open && time < self.close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nse_session() -> MarketSession {
        MarketSession::from_config(&SessionConfig::default()).unwrap()
    }

    fn ist_nanos(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> i64 {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    #[test]
    fn test_open_during_trading_hours() {
        // 2024-02-14 is a Wednesday
        let session = nse_session();
        assert!(session.is_open(ist_nanos(2024, 2, 14, 9, 15)));
        assert!(session.is_open(ist_nanos(2024, 2, 14, 12, 0)));
        assert!(!session.is_open(ist_nanos(2024, 2, 14, 15, 30)));
        assert!(!session.is_open(ist_nanos(2024, 2, 14, 9, 14)));
    }

    #[test]
    fn test_closed_on_weekend() {
        // 2024-02-17 is a Saturday
        assert!(!nse_session().is_open(ist_nanos(2024, 2, 17, 11, 0)));
    }

    #[test]
    fn test_always_open() {
        assert!(MarketSession::always_open().is_open(0));
    }

    #[test]
    fn test_rejects_unknown_weekday() {
        let config = SessionConfig {
            trading_days: vec!["Funday".into()],
            ..SessionConfig::default()
        };
        assert!(MarketSession::from_config(&config).is_err());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance_secs(2);
        assert_eq!(clock.now_nanos(), 2_000_001_000);
    }
}
