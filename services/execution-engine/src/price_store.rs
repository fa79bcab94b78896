//! Price store: latest prices, pub/sub channels, TTL keys and lists
//!
//! The engine depends only on the [`PriceStore`] trait. [`InMemoryPriceStore`]
//! implements it in-process with `tokio::sync::broadcast` channels; a
//! networked key-value store can be slotted in behind the same trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::errors::{EngineError, EngineResult};
use types::ids::InstrumentId;
use types::numeric::Price;

use crate::keys;

/// Message published on `prices:{instrument}` and `price_updates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub instrument: InstrumentId,
    pub price: Price,
    pub timestamp: i64,
}

/// Receiving end of a channel subscription.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is closed.
    ///
    /// A slow subscriber skips what it missed rather than failing.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn get_price(&self, instrument: &InstrumentId) -> EngineResult<Option<Price>>;

    /// Store the latest price and publish it on `prices:{instrument}` and
    /// `price_updates`.
    async fn set_price(&self, instrument: &InstrumentId, price: Price, timestamp: i64)
        -> EngineResult<()>;

    /// Publish to a channel. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, message: String) -> EngineResult<usize>;

    async fn subscribe(&self, channel: &str) -> EngineResult<Subscription>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()>;

    /// Set only if absent. Returns whether the key was set.
    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;

    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    async fn exists(&self, key: &str) -> EngineResult<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> EngineResult<bool>;

    /// Remove `key` only while it still holds `expected`. Returns whether it
    /// was removed.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> EngineResult<bool>;

    async fn list_push(&self, key: &str, value: &str) -> EngineResult<()>;

    /// Remove every occurrence of `value`. Returns the number removed.
    async fn list_remove(&self, key: &str, value: &str) -> EngineResult<usize>;

    async fn list_range(&self, key: &str) -> EngineResult<Vec<String>>;
}

// ── In-memory implementation ────────────────────────────────────────

#[derive(Debug, Clone)]
struct TtlValue {
    value: String,
    expires_at: Option<Instant>,
}

impl TtlValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct InMemoryPriceStore {
    values: DashMap<String, TtlValue>,
    lists: DashMap<String, Vec<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
    available: AtomicBool,
}

impl Default for InMemoryPriceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(1024)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            values: DashMap::new(),
            lists: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `TransientInfra`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::TransientInfra("price store unavailable".into()))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.values.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove_if(key, |_, v| !v.is_live(now));
        }
        None
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn get_price(&self, instrument: &InstrumentId) -> EngineResult<Option<Price>> {
        self.check_available()?;
        // Latest prices live under `price:{instrument}` like any other key
        Ok(self
            .live_value(&keys::price_key(instrument))
            .and_then(|raw| Price::from_str(&raw)))
    }

    async fn set_price(
        &self,
        instrument: &InstrumentId,
        price: Price,
        timestamp: i64,
    ) -> EngineResult<()> {
        self.check_available()?;
        self.values.insert(
            keys::price_key(instrument),
            TtlValue {
                value: price.to_string(),
                expires_at: None,
            },
        );

        let tick = PriceTick {
            instrument: instrument.clone(),
            price,
            timestamp,
        };
        let message = serde_json::to_string(&tick)
            .map_err(|e| EngineError::TransientInfra(format!("encode price tick: {}", e)))?;
        self.publish(&keys::price_channel(instrument), message.clone()).await?;
        self.publish(keys::PRICE_UPDATES_CHANNEL, message).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> EngineResult<usize> {
        self.check_available()?;
        // A send error only means nobody is listening
        let reached = self.sender(channel).send(message).unwrap_or(0);
        debug!(channel, reached, "Published");
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> EngineResult<Subscription> {
        self.check_available()?;
        Ok(Subscription {
            channel: channel.to_string(),
            rx: self.sender(channel).subscribe(),
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
        self.check_available()?;
        self.values.insert(
            key.to_string(),
            TtlValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let fresh = TtlValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        let acquired = match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        Ok(acquired)
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        self.check_available()?;
        Ok(self.live_value(key))
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        self.check_available()?;
        Ok(self.live_value(key).is_some())
    }

    async fn delete(&self, key: &str) -> EngineResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .values
            .remove(key)
            .map_or(false, |(_, v)| v.is_live(now)))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> EngineResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .values
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn list_push(&self, key: &str, value: &str) -> EngineResult<()> {
        self.check_available()?;
        self.lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> EngineResult<usize> {
        self.check_available()?;
        let mut removed = 0;
        if let Some(mut list) = self.lists.get_mut(key) {
            let before = list.len();
            list.retain(|v| v != value);
            removed = before - list.len();
        }
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(removed)
    }

    async fn list_range(&self, key: &str) -> EngineResult<Vec<String>> {
        self.check_available()?;
        Ok(self.lists.get(key).map(|l| l.clone()).unwrap_or_default())
    }
}
