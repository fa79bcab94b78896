//! Key and channel names in the price store

use types::ids::{InstrumentId, OrderId, UserId};

/// Every price update, regardless of instrument
pub const PRICE_UPDATES_CHANNEL: &str = "price_updates";

pub fn price_key(instrument: &InstrumentId) -> String {
    format!("price:{}", instrument)
}

/// Per-instrument price channel
pub fn price_channel(instrument: &InstrumentId) -> String {
    format!("prices:{}", instrument)
}

/// Execution claim; the value is the holder's token
pub fn lock_key(order_id: &OrderId) -> String {
    format!("lock:order:{}", order_id)
}

pub fn tombstone_key(order_id: &OrderId) -> String {
    format!("tombstone:order:{}", order_id)
}

pub fn watchlist_key(instrument: &InstrumentId) -> String {
    format!("watchlist:{}", instrument)
}

pub fn portfolio_view_key(user_id: &UserId) -> String {
    format!("view:portfolio:{}", user_id)
}
