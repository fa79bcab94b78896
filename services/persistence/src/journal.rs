//! Journal Writer: Append-only ledger journal with checksums
//!
//! # Binary Format (per entry)
//! ```text
//! [total_len: u32]
//! [sequence:  u64]
//! [timestamp: i64]
//! [record_type_len: u16][record_type: bytes]
//! [payload_len: u32][payload: bytes]
//! [checksum: u32]  // CRC32C over sequence+timestamp+record_type+payload
//! ```
//!
//! Payloads are bincode-encoded ledger records; the journal itself does not
//! know their shape.

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::reader::JournalReader;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u64, got: u64 },
}

impl From<bincode::Error> for JournalError {
    fn from(err: bincode::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}

// ── Journal Entry ───────────────────────────────────────────────────

/// A single journal entry: one committed ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Gapless sequence number, starting at 1
    pub sequence: u64,
    /// Unix nanosecond commit timestamp
    pub timestamp: i64,
    /// Record type label, e.g. `"ledger_tx"`
    pub record_type: String,
    /// Bincode-serialized record payload
    pub payload: Vec<u8>,
    /// CRC32C checksum over (sequence ++ timestamp ++ record_type ++ payload)
    pub checksum: u32,
}

impl JournalEntry {
    /// Create a new entry, computing the CRC32C checksum automatically.
    pub fn new(sequence: u64, timestamp: i64, record_type: String, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp, &record_type, &payload);
        Self {
            sequence,
            timestamp,
            record_type,
            payload,
            checksum,
        }
    }

    pub fn compute_checksum(
        sequence: u64,
        timestamp: i64,
        record_type: &str,
        payload: &[u8],
    ) -> u32 {
        let mut buf = Vec::with_capacity(8 + 8 + record_type.len() + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(record_type.as_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum
            == Self::compute_checksum(self.sequence, self.timestamp, &self.record_type, &self.payload)
    }

    /// Decode the payload into a typed record.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, JournalError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize entry to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let type_bytes = self.record_type.as_bytes();
        let type_len = type_bytes.len() as u16;
        let payload_len = self.payload.len() as u32;

        // 8 (seq) + 8 (ts) + 2 (type_len) + type + 4 (payload_len) + payload + 4 (crc)
        let body_len: u32 = 8 + 8 + 2 + (type_len as u32) + 4 + payload_len + 4;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&type_len.to_le_bytes());
        buf.extend_from_slice(type_bytes);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize entry from the binary wire format.
    ///
    /// Returns `(entry, bytes_consumed)`. Truncated or implausible frames
    /// return an error instead of panicking.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let mut cursor = Cursor::new(data);
        let body_len = cursor.u32()? as usize;

        // Reject absurdly large frames (likely corruption)
        if body_len > 64 * 1024 * 1024 {
            return Err(JournalError::Serialization(format!(
                "Implausible body length: {}",
                body_len
            )));
        }
        // Minimum body: 8 + 8 + 2 + 0 + 4 + 0 + 4
        if body_len < 26 {
            return Err(JournalError::Serialization(format!(
                "Body too small: {} bytes",
                body_len
            )));
        }
        if data.len() < 4 + body_len {
            return Err(JournalError::Serialization(format!(
                "Incomplete entry: need {} bytes, have {}",
                4 + body_len,
                data.len()
            )));
        }

        let sequence = cursor.u64()?;
        let timestamp = cursor.u64()? as i64;
        let type_len = cursor.u16()? as usize;
        let record_type = String::from_utf8(cursor.take(type_len)?.to_vec())
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();
        let checksum = cursor.u32()?;

        if cursor.pos != 4 + body_len {
            return Err(JournalError::Serialization(format!(
                "Frame length mismatch: declared {}, parsed {}",
                4 + body_len,
                cursor.pos
            )));
        }

        Ok((
            Self {
                sequence,
                timestamp,
                record_type,
                payload,
                checksum,
            },
            cursor.pos,
        ))
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], JournalError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                JournalError::Serialization(format!(
                    "Unexpected end of frame at offset {} (wanted {} bytes)",
                    self.pos, len
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, JournalError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, JournalError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, JournalError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory for journal files.
    pub dir: PathBuf,
    /// Maximum file size in bytes before rotation (default 64 MiB).
    pub max_file_size: u64,
    /// fsync after every append. Off trades durability for latency.
    pub fsync_every_write: bool,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: 64 * 1024 * 1024,
            fsync_every_write: true,
        }
    }
}

// ── Journal Writer ──────────────────────────────────────────────────

/// Append-only journal writer with checksums and rotation.
pub struct JournalWriter {
    config: JournalConfig,
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_file_size: u64,
    next_sequence: u64,
    file_index: u64,
}

impl JournalWriter {
    /// Open the journal, creating the directory if needed.
    ///
    /// Existing entries are scanned to continue the sequence. If the newest
    /// file ends in a torn write, appends go to a fresh file so the damaged
    /// tail never sits between valid entries.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;

        let (last_sequence, damaged) = Self::scan_existing(&config.dir)?;
        let mut file_index = Self::find_latest_index(&config.dir);
        if damaged {
            file_index += 1;
            warn!(
                dir = %config.dir.display(),
                file_index,
                "Journal tail damaged; continuing in a new file"
            );
        }

        let current_file = Self::journal_path(&config.dir, file_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_file)?;
        let current_file_size = file.metadata()?.len();

        info!(
            file = %current_file.display(),
            next_sequence = last_sequence + 1,
            "Journal opened"
        );

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            current_file,
            current_file_size,
            next_sequence: last_sequence + 1,
            file_index,
        })
    }

    /// Sequence number the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn current_file_path(&self) -> &Path {
        &self.current_file
    }

    /// Serialize `record` with bincode and append it under the next sequence.
    pub fn append_record<T: Serialize>(
        &mut self,
        timestamp: i64,
        record_type: &str,
        record: &T,
    ) -> Result<JournalEntry, JournalError> {
        let payload = bincode::serialize(record)?;
        let entry = JournalEntry::new(self.next_sequence, timestamp, record_type.to_string(), payload);
        self.append(&entry)?;
        Ok(entry)
    }

    /// Append a prepared entry. Its sequence must be the next expected one.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        if entry.sequence != self.next_sequence {
            return Err(JournalError::SequenceError {
                expected: self.next_sequence,
                got: entry.sequence,
            });
        }

        if self.current_file_size >= self.config.max_file_size {
            self.rotate()?;
        }

        let bytes = entry.to_bytes();
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        if self.config.fsync_every_write {
            self.writer.get_ref().sync_data()?;
        }

        self.current_file_size += bytes.len() as u64;
        self.next_sequence = entry.sequence + 1;
        Ok(())
    }

    /// Force flush + fsync (used before shutdown / rotation).
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync()?;

        self.file_index += 1;
        self.current_file = Self::journal_path(&self.config.dir, self.file_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)?;

        self.writer = BufWriter::new(file);
        self.current_file_size = 0;
        Ok(())
    }

    /// Returns (last valid sequence, whether any corruption was found).
    fn scan_existing(dir: &Path) -> Result<(u64, bool), JournalError> {
        let mut reader = JournalReader::open(dir).map_err(|e| match e {
            crate::reader::ReaderError::Io(io) => JournalError::Io(io),
            other => JournalError::Serialization(other.to_string()),
        })?;
        let (entries, corruption) = reader.recover_entries();
        let last = entries.last().map(|e| e.sequence).unwrap_or(0);
        Ok((last, !corruption.is_empty()))
    }

    pub(crate) fn journal_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("journal-{:06}.bin", index))
    }

    pub(crate) fn parse_index(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix("journal-")?
            .strip_suffix(".bin")?
            .parse::<u64>()
            .ok()
    }

    fn find_latest_index(dir: &Path) -> u64 {
        fs::read_dir(dir)
            .ok()
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| Self::parse_index(&e.file_name().to_string_lossy()))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
