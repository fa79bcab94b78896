//! Ledger journal persistence
//!
//! Provides the append-only journal the order ledger writes every committed
//! transaction to, and the reader used to rebuild ledger state on startup.
//!
//! # Guarantees
//! - Every entry carries a CRC32C checksum over its header and payload
//! - Sequence numbers are gapless and strictly increasing
//! - A torn write at the tail (crash mid-append) is detected and skipped;
//!   the valid prefix is still replayed

pub mod journal;
pub mod reader;

pub use journal::{JournalConfig, JournalEntry, JournalError, JournalWriter};
pub use reader::{CorruptionKind, CorruptionRecord, JournalReader, ReaderError};
