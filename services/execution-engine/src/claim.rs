//! Per-order execution claim
//!
//! `lock:order:{id}` holds a token unique to its holder, so releasing a claim
//! never removes someone else's. Matching workers take the claim before
//! evaluating an order and cancellation takes it before deleting one, which
//! keeps a cancel from landing between a worker's status check and its
//! settlement commit.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use types::errors::EngineResult;
use types::ids::OrderId;
use uuid::Uuid;

use crate::keys;
use crate::price_store::PriceStore;

/// Pause between attempts while waiting for a held claim.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct OrderClaim {
    order_id: OrderId,
    key: String,
    token: String,
}

impl OrderClaim {
    /// Take the claim if nobody holds it.
    pub async fn try_acquire(
        store: &dyn PriceStore,
        order_id: OrderId,
        ttl: Duration,
    ) -> EngineResult<Option<Self>> {
        let key = keys::lock_key(&order_id);
        let token = Uuid::now_v7().to_string();
        if store.set_nx_with_ttl(&key, &token, ttl).await? {
            Ok(Some(Self {
                order_id,
                key,
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Take the claim, waiting up to `wait` for the current holder to let go.
    pub async fn acquire_within(
        store: &dyn PriceStore,
        order_id: OrderId,
        ttl: Duration,
        wait: Duration,
    ) -> EngineResult<Option<Self>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(claim) = Self::try_acquire(store, order_id, ttl).await? {
                return Ok(Some(claim));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(%order_id, waited_ms = wait.as_millis() as u64, "Order claim still held");
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Give the claim back. A claim that expired and was taken over stays
    /// with its new holder.
    pub async fn release(self, store: &dyn PriceStore) {
        match store.delete_if_eq(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(order_id = %self.order_id, "Order claim expired before release");
            }
            // The TTL frees it eventually
            Err(e) => warn!(order_id = %self.order_id, error = %e, "Failed to release order claim"),
        }
    }
}
