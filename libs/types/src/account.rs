//! User accounting types
//!
//! Invariant: `available >= 0` and `reserved >= 0` at all times. The
//! reserved balance equals the notional of the user's OPEN BUY orders.

use crate::ids::{InstrumentId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A position in one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub quantity: u64,
    /// Weighted-average cost basis per unit
    pub average_cost: Decimal,
}

/// Cash balances and holdings of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    /// Spendable cash
    pub available: Decimal,
    /// Cash earmarked against OPEN BUY orders
    pub reserved: Decimal,
    /// BTreeMap keeps serialized output and iteration order stable
    pub holdings: BTreeMap<InstrumentId, Holding>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,
}

impl UserAccount {
    /// Create a new account funded with `available` cash
    pub fn new(user_id: UserId, available: Decimal, timestamp: i64) -> Self {
        Self {
            user_id,
            available,
            reserved: Decimal::ZERO,
            holdings: BTreeMap::new(),
            created_at: timestamp,
            updated_at: timestamp,
            version: 0,
        }
    }

    /// Check the non-negativity invariant
    pub fn check_invariant(&self) -> bool {
        self.available >= Decimal::ZERO && self.reserved >= Decimal::ZERO
    }

    /// available + reserved
    pub fn total_cash(&self) -> Decimal {
        self.available + self.reserved
    }

    /// Held quantity of an instrument (zero when absent)
    pub fn held_quantity(&self, instrument: &InstrumentId) -> u64 {
        self.holdings.get(instrument).map(|h| h.quantity).unwrap_or(0)
    }

    pub fn holding(&self, instrument: &InstrumentId) -> Option<&Holding> {
        self.holdings.get(instrument)
    }
}
