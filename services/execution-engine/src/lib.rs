//! Execution Engine Service
//!
//! Paper-trading order execution: users place LIMIT and MARKET orders
//! against simulated cash, and the engine settles each order at the first
//! observed market price that satisfies its trigger rule.
//!
//! **Flow:**
//! - Admission validates, reserves funds and enqueues an evaluation job
//! - The matching worker claims the order and either executes it, parks it
//!   on the instrument watchlist or fails it (session closed / max wait)
//! - The price dispatcher turns ticks into jobs for parked orders
//!
//! **Key Invariants:**
//! - `available >= 0` and `reserved >= 0` on every account
//! - `reserved` equals the notional of the user's OPEN BUY orders
//! - An order reaches a terminal state at most once
//! - A BUY never executes above its target; a SELL never below

pub mod accountant;
pub mod admission;
pub mod claim;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod engine;
pub mod feed;
pub mod keys;
pub mod ledger;
pub mod notifier;
pub mod price_store;
pub mod session;
pub mod watchlist;
pub mod worker;

pub use admission::{AdmissionService, PlaceOrder, PortfolioView, UpdateOrder};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineBuilder};
pub use ledger::{InMemoryLedger, LedgerTx, OrderLedger};
pub use price_store::{InMemoryPriceStore, PriceStore, PriceTick};
pub use session::{Clock, ManualClock, MarketSession, SystemClock};
