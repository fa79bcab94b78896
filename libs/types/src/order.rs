//! Order lifecycle types
//!
//! An order is created OPEN and leaves that state exactly once, either to
//! CLOSED (executed) or FAILED (no trigger before the market closed or the
//! maximum wait elapsed). Terminal orders are immutable.

use crate::errors::{EngineError, EngineResult};
use crate::ids::{InstrumentId, OrderId, UserId};
use crate::numeric::{Price, Quantity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    BUY,
    SELL,
}

impl Side {
    /// Trigger rule shared by MARKET and LIMIT orders.
    ///
    /// A BUY triggers once the market trades at or below its target, a SELL
    /// once the market trades at or above it. The trader never gets a worse
    /// price than the target.
    pub fn is_triggered(&self, target: Price, current: Price) -> bool {
        match self {
            Side::BUY => current <= target,
            Side::SELL => current >= target,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::BUY => write!(f, "BUY"),
            Side::SELL => write!(f, "SELL"),
        }
    }
}

/// Order kind. MARKET orders carry the price snapshotted at placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    MARKET,
    LIMIT,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Accepted and waiting for a trigger
    OPEN,
    /// Executed (terminal)
    CLOSED,
    /// Expired without a trigger (terminal)
    FAILED,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::OPEN)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderStatus::OPEN => "OPEN",
            OrderStatus::CLOSED => "CLOSED",
            OrderStatus::FAILED => "FAILED",
        };
        f.write_str(label)
    }
}

/// Complete order record as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Quantity,
    pub kind: OrderKind,
    pub target_price: Price,
    pub executed_price: Option<Price>,
    pub status: OrderStatus,
    pub created_at: i64, // Unix nanos
    pub updated_at: i64, // Unix nanos
    pub version: u64,    // Optimistic locking
}

impl Order {
    /// Create a new OPEN order
    pub fn new(
        user_id: UserId,
        instrument: InstrumentId,
        side: Side,
        quantity: Quantity,
        kind: OrderKind,
        target_price: Price,
        timestamp: i64,
    ) -> Self {
        Self {
            order_id: OrderId::new(),
            user_id,
            instrument,
            side,
            quantity,
            kind,
            target_price,
            executed_price: None,
            status: OrderStatus::OPEN,
            created_at: timestamp,
            updated_at: timestamp,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::OPEN
    }

    /// Cash this order keeps reserved while OPEN (zero for SELL orders).
    pub fn reserved_amount(&self) -> EngineResult<rust_decimal::Decimal> {
        match (self.side, self.status) {
            (Side::BUY, OrderStatus::OPEN) => self.target_price.notional(self.quantity),
            _ => Ok(rust_decimal::Decimal::ZERO),
        }
    }

    /// Whether `current` satisfies this order's trigger rule
    pub fn is_triggered_at(&self, current: Price) -> bool {
        self.side.is_triggered(self.target_price, current)
    }

    /// Transition OPEN → CLOSED at `executed_price`.
    ///
    /// Rejects execution at a price the trigger rule would not allow.
    pub fn close(&mut self, executed_price: Price, timestamp: i64) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !self.is_triggered_at(executed_price) {
            return Err(EngineError::InvalidState(format!(
                "{} order {} cannot execute at {} against target {}",
                self.side, self.order_id, executed_price, self.target_price
            )));
        }
        self.executed_price = Some(executed_price);
        self.status = OrderStatus::CLOSED;
        self.updated_at = timestamp;
        Ok(())
    }

    /// Transition OPEN → FAILED
    pub fn fail(&mut self, timestamp: i64) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.status = OrderStatus::FAILED;
        self.updated_at = timestamp;
        Ok(())
    }

    /// Edit price, quantity and kind of an OPEN order
    pub fn amend(
        &mut self,
        target_price: Price,
        quantity: Quantity,
        kind: OrderKind,
        timestamp: i64,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.target_price = target_price;
        self.quantity = quantity;
        self.kind = kind;
        self.updated_at = timestamp;
        Ok(())
    }

    pub fn ensure_open(&self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "order {} is already {}",
                self.order_id, self.status
            )));
        }
        Ok(())
    }
}
