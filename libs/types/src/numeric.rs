//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! Quantities are whole units: partial fills do not exist in this engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{EngineError, EngineResult};

/// A strictly positive price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    /// Try to create a price, returning None unless `value > 0`
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value.normalize()))
        } else {
            None
        }
    }

    /// Create from a whole number of currency units
    ///
    /// # Panics
    /// Panics if `value` is zero
    pub fn from_u64(value: u64) -> Self {
        Self::try_new(Decimal::from(value)).expect("Price must be positive")
    }

    /// Parse from a decimal string such as `"101.25"`
    pub fn from_str(value: &str) -> Option<Self> {
        Decimal::from_str(value).ok().and_then(Self::try_new)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Price × quantity, the cash amount an order reserves or settles.
    ///
    /// Fails with `Validation` when the product does not fit in a `Decimal`.
    pub fn notional(&self, quantity: Quantity) -> EngineResult<Decimal> {
        self.0.checked_mul(quantity.as_decimal()).ok_or_else(|| {
            EngineError::Validation(format!(
                "notional of {} x {} is out of range",
                quantity, self.0
            ))
        })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<Decimal> for Price {
    type Error = String;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_new(value).ok_or_else(|| format!("price must be positive, got {}", value))
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}

/// A strictly positive whole-unit quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Quantity(u64);

impl Quantity {
    pub fn try_new(value: u64) -> Option<Self> {
        if value > 0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// # Panics
    /// Panics if `value` is zero
    pub fn new(value: u64) -> Self {
        Self::try_new(value).expect("Quantity must be positive")
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for Quantity {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::try_new(value).ok_or_else(|| "quantity must be a positive integer".to_string())
    }
}

impl From<Quantity> for u64 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}
