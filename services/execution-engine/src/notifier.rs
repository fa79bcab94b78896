//! Notification fan-out on the `order_updates` channel
//!
//! Publishing is best-effort: a failure is logged and swallowed, because the
//! ledger has already committed and stays authoritative.

use std::sync::Arc;

use tracing::{debug, warn};
use types::errors::EngineResult;
use types::notification::{OrderUpdate, ORDER_UPDATES_CHANNEL};

use crate::price_store::{PriceStore, Subscription};

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn PriceStore>,
}

impl Notifier {
    pub fn new(store: Arc<dyn PriceStore>) -> Self {
        Self { store }
    }

    pub async fn publish(&self, update: &OrderUpdate) {
        let message = match serde_json::to_string(update) {
            Ok(message) => message,
            Err(e) => {
                warn!(order_id = %update.order_id, error = %e, "Failed to encode order update");
                return;
            }
        };
        match self.store.publish(ORDER_UPDATES_CHANNEL, message).await {
            Ok(reached) => debug!(
                order_id = %update.order_id,
                kind = ?update.kind,
                reached,
                "Order update published"
            ),
            Err(e) => warn!(
                order_id = %update.order_id,
                kind = ?update.kind,
                error = %e,
                "Order update not delivered"
            ),
        }
    }

    /// Typed subscription to every order update.
    pub async fn subscribe(&self) -> EngineResult<UpdateStream> {
        Ok(UpdateStream {
            inner: self.store.subscribe(ORDER_UPDATES_CHANNEL).await?,
        })
    }
}

pub struct UpdateStream {
    inner: Subscription,
}

impl UpdateStream {
    /// Next decodable update; `None` once the channel closes.
    pub async fn next(&mut self) -> Option<OrderUpdate> {
        loop {
            let raw = self.inner.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(update) => return Some(update),
                Err(e) => warn!(error = %e, "Skipping undecodable order update"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_store::InMemoryPriceStore;
    use types::ids::{InstrumentId, UserId};
    use types::notification::UpdateKind;
    use types::numeric::{Price, Quantity};
    use types::order::{Order, OrderKind, Side};

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = Arc::new(InMemoryPriceStore::new());
        let notifier = Notifier::new(store.clone());
        let mut stream = notifier.subscribe().await.unwrap();

        let order = Order::new(
            UserId::new(),
            InstrumentId::new("SBIN"),
            Side::BUY,
            Quantity::new(2),
            OrderKind::LIMIT,
            Price::from_u64(600),
            1,
        );
        notifier.publish(&OrderUpdate::failed(&order, 2)).await;

        let update = stream.next().await.unwrap();
        assert_eq!(update.kind, UpdateKind::Failed);
        assert_eq!(update.order_id, order.order_id);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let store = Arc::new(InMemoryPriceStore::new());
        let notifier = Notifier::new(store.clone());
        store.set_available(false);

        let order = Order::new(
            UserId::new(),
            InstrumentId::new("SBIN"),
            Side::SELL,
            Quantity::new(1),
            OrderKind::LIMIT,
            Price::from_u64(600),
            1,
        );
        // Must not panic or propagate
        notifier.publish(&OrderUpdate::deleted(&order, 2)).await;
    }
}
