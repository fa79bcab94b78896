//! Types library for the paper-trading execution engine
//!
//! Core type definitions shared by the ledger, the execution engine and the
//! gateway.
//!
//! # Modules
//! - `ids`: Unique identifiers (OrderId, UserId, InstrumentId)
//! - `numeric`: Positive price and whole-unit quantity types
//! - `order`: Order lifecycle types and the trigger rule
//! - `account`: Cash balances and holdings
//! - `notification`: Order update events
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod numeric;
pub mod order;
pub mod account;
pub mod notification;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Current wall-clock time in Unix nanoseconds
pub fn unix_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::order::*;
    pub use crate::account::*;
    pub use crate::notification::*;
    pub use crate::errors::*;
}
