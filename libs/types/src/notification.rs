//! Order update notifications
//!
//! Published on the `order_updates` channel after every terminal transition
//! and every successful update/cancel. Delivery is best-effort; the ledger
//! stays the source of truth.

use crate::ids::{InstrumentId, OrderId, UserId};
use crate::numeric::{Price, Quantity};
use crate::order::{Order, Side};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known pub/sub channel name for order updates
pub const ORDER_UPDATES_CHANNEL: &str = "order_updates";

/// Kind of change being announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Executed,
    Failed,
    Updated,
    Deleted,
}

/// JSON payload delivered to the live-update relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub event_id: Uuid,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub kind: UpdateKind,
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Quantity,
    /// Target price before the change (updates only)
    pub old_price: Option<Price>,
    /// Target price after the change
    pub new_price: Option<Price>,
    pub executed_price: Option<Price>,
    pub timestamp: i64,
}

impl OrderUpdate {
    fn base(order: &Order, kind: UpdateKind, timestamp: i64) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            user_id: order.user_id,
            order_id: order.order_id,
            kind,
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.quantity,
            old_price: None,
            new_price: Some(order.target_price),
            executed_price: order.executed_price,
            timestamp,
        }
    }

    pub fn executed(order: &Order, timestamp: i64) -> Self {
        Self::base(order, UpdateKind::Executed, timestamp)
    }

    pub fn failed(order: &Order, timestamp: i64) -> Self {
        Self::base(order, UpdateKind::Failed, timestamp)
    }

    pub fn updated(order: &Order, old_price: Price, timestamp: i64) -> Self {
        Self {
            old_price: Some(old_price),
            ..Self::base(order, UpdateKind::Updated, timestamp)
        }
    }

    pub fn deleted(order: &Order, timestamp: i64) -> Self {
        Self {
            old_price: Some(order.target_price),
            new_price: None,
            ..Self::base(order, UpdateKind::Deleted, timestamp)
        }
    }
}
