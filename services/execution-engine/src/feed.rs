//! Price feed ingestion
//!
//! A [`PriceSource`] yields ticks; the [`FeedSupervisor`] writes each one to
//! the price store (which publishes it on `prices:{instrument}`) and
//! reconnects with capped exponential backoff when the source drops.
//!
//! [`RandomWalkSource`] is the built-in simulated market: a seeded random
//! walk per instrument, so a session can be replayed exactly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use types::errors::{EngineError, EngineResult};
use types::ids::InstrumentId;
use types::numeric::Price;

use crate::config::FeedConfig;
use crate::price_store::{PriceStore, PriceTick};
use crate::session::Clock;

#[async_trait]
pub trait PriceSource: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self) -> EngineResult<()>;

    /// Next tick. `Ok(None)` means the source is exhausted for good;
    /// an error means the connection dropped and should be re-established.
    async fn next_tick(&mut self) -> EngineResult<Option<PriceTick>>;
}

// ── Random walk ─────────────────────────────────────────────────────

pub struct RandomWalkSource {
    instruments: Vec<(InstrumentId, Decimal)>,
    rng: ChaCha8Rng,
    interval: Duration,
    volatility_bps: u32,
    cursor: usize,
    clock: Arc<dyn Clock>,
}

impl RandomWalkSource {
    pub fn from_config(config: &FeedConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let mut instruments = Vec::with_capacity(config.instruments.len());
        for entry in &config.instruments {
            let id = InstrumentId::try_new(entry.symbol.as_str()).ok_or_else(|| {
                EngineError::Validation(format!("invalid feed symbol {:?}", entry.symbol))
            })?;
            if entry.seed_price <= Decimal::ZERO {
                return Err(EngineError::Validation(format!(
                    "seed price for {} must be positive",
                    id
                )));
            }
            instruments.push((id, entry.seed_price));
        }

        Ok(Self {
            instruments,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            interval: Duration::from_millis(config.tick_interval_ms),
            volatility_bps: config.volatility_bps,
            cursor: 0,
            clock,
        })
    }

    fn step(&mut self) -> Option<PriceTick> {
        if self.instruments.is_empty() {
            return None;
        }
        let floor = Decimal::new(1, 2);
        let volatility = self.volatility_bps as i64;
        let moved_bps = self.rng.gen_range(-volatility..=volatility);

        let (instrument, last) = &mut self.instruments[self.cursor];
        let next = (*last + *last * Decimal::new(moved_bps, 4)).round_dp(2).max(floor);
        *last = next;
        let tick = PriceTick {
            instrument: instrument.clone(),
            price: Price::try_new(next)?,
            timestamp: self.clock.now_nanos(),
        };
        self.cursor = (self.cursor + 1) % self.instruments.len();
        Some(tick)
    }
}

#[async_trait]
impl PriceSource for RandomWalkSource {
    fn name(&self) -> &str {
        "random-walk"
    }

    async fn connect(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn next_tick(&mut self) -> EngineResult<Option<PriceTick>> {
        if self.instruments.is_empty() {
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;
        Ok(self.step())
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Counters returned when the supervisor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub ticks_published: u64,
    pub reconnects: u32,
}

pub struct FeedSupervisor {
    source: Box<dyn PriceSource>,
    store: Arc<dyn PriceStore>,
    config: FeedConfig,
}

impl FeedSupervisor {
    pub fn new(source: Box<dyn PriceSource>, store: Arc<dyn PriceStore>, config: FeedConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> FeedReport {
        let mut report = FeedReport::default();
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.source.connect().await {
                Ok(()) => {
                    attempt = 0;
                    info!(source = self.source.name(), "Price feed connected");
                    match self.pump(&mut shutdown, &mut report).await {
                        Pump::Stopped => break,
                        Pump::Exhausted => {
                            info!(source = self.source.name(), "Price feed exhausted");
                            break;
                        }
                        Pump::Disconnected(e) => {
                            warn!(source = self.source.name(), error = %e, "Price feed disconnected");
                        }
                    }
                }
                Err(e) => warn!(source = self.source.name(), error = %e, "Price feed connect failed"),
            }

            attempt += 1;
            report.reconnects += 1;
            let delay = self.config.reconnect_backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting price feed");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            ticks = report.ticks_published,
            reconnects = report.reconnects,
            "Price feed stopped"
        );
        report
    }

    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>, report: &mut FeedReport) -> Pump {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Pump::Stopped;
                    }
                }
                next = self.source.next_tick() => match next {
                    Ok(Some(tick)) => {
                        match self.store.set_price(&tick.instrument, tick.price, tick.timestamp).await {
                            Ok(()) => report.ticks_published += 1,
                            Err(e) => warn!(
                                instrument = %tick.instrument,
                                error = %e,
                                "Dropped price tick"
                            ),
                        }
                    }
                    Ok(None) => return Pump::Exhausted,
                    Err(e) => return Pump::Disconnected(e),
                }
            }
        }
    }
}

enum Pump {
    Stopped,
    Exhausted,
    Disconnected(EngineError),
}
