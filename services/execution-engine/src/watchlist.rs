//! Per-instrument watchlists of orders waiting for their trigger price.
//!
//! Stored as lists under `watchlist:{instrument}` in the price store.

use std::sync::Arc;

use tracing::warn;
use types::errors::EngineResult;
use types::ids::{InstrumentId, OrderId};

use crate::keys;
use crate::price_store::PriceStore;

#[derive(Clone)]
pub struct Watchlist {
    store: Arc<dyn PriceStore>,
}

impl Watchlist {
    pub fn new(store: Arc<dyn PriceStore>) -> Self {
        Self { store }
    }

    /// Park an order. Adding an order that is already listed is a no-op.
    pub async fn add(&self, instrument: &InstrumentId, order_id: &OrderId) -> EngineResult<()> {
        let key = keys::watchlist_key(instrument);
        let id = order_id.to_string();
        if self.store.list_range(&key).await?.contains(&id) {
            return Ok(());
        }
        self.store.list_push(&key, &id).await
    }

    pub async fn remove(&self, instrument: &InstrumentId, order_id: &OrderId) -> EngineResult<bool> {
        let removed = self
            .store
            .list_remove(&keys::watchlist_key(instrument), &order_id.to_string())
            .await?;
        Ok(removed > 0)
    }

    /// Order ids parked on `instrument`. Unparseable entries are skipped.
    pub async fn members(&self, instrument: &InstrumentId) -> EngineResult<Vec<OrderId>> {
        let raw = self.store.list_range(&keys::watchlist_key(instrument)).await?;
        Ok(raw
            .iter()
            .filter_map(|id| match id.parse::<OrderId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(instrument = %instrument, entry = %id, "Ignoring malformed watchlist entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_store::InMemoryPriceStore;

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let watchlist = Watchlist::new(Arc::new(InMemoryPriceStore::new()));
        let instrument = InstrumentId::new("TCS");
        let id = OrderId::new();

        watchlist.add(&instrument, &id).await.unwrap();
        watchlist.add(&instrument, &id).await.unwrap();
        assert_eq!(watchlist.members(&instrument).await.unwrap(), vec![id]);

        assert!(watchlist.remove(&instrument, &id).await.unwrap());
        assert!(!watchlist.remove(&instrument, &id).await.unwrap());
        assert!(watchlist.members(&instrument).await.unwrap().is_empty());
    }
}
