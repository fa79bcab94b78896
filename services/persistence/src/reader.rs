//! Journal Reader: Sequential replay with corruption detection
//!
//! - CRC32C validation on every entry
//! - Torn tail detection: an unparseable frame ends the current file,
//!   the valid prefix is kept and reading continues in the next file
//! - Checksum mismatches are logged and skipped
//! - Typed replay of ledger records via bincode

use crate::journal::{JournalEntry, JournalError, JournalWriter};
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch at byte offset {offset}: entry seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence not monotonic: prev={prev}, current={current}")]
    NotMonotonic { prev: u64, current: u64 },
}

// ── Corruption Log Entry ────────────────────────────────────────────

/// Structured corruption log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// File in which the damage was found.
    pub file: PathBuf,
    /// Byte offset within that file.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedEntry,
    UndecodableRecord,
}

// ── Journal Reader ──────────────────────────────────────────────────

/// Sequential journal reader across all rotated files in a directory.
pub struct JournalReader {
    files: Vec<PathBuf>,
    current_file_idx: usize,
    data: Vec<u8>,
    pos: usize,
    last_sequence: Option<u64>,
    corruption_log: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// Open a reader over all journal files in `dir`.
    ///
    /// A missing directory reads as an empty journal.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let files = Self::discover_files(dir)?;
        let data = match files.first() {
            Some(path) => fs::read(path)?,
            None => Vec::new(),
        };
        Ok(Self {
            files,
            current_file_idx: 0,
            data,
            pos: 0,
            last_sequence: None,
            corruption_log: Vec::new(),
        })
    }

    /// Read the next valid entry.
    ///
    /// Returns `Ok(None)` once every file is exhausted. A checksum failure is
    /// returned as an error after the bad frame has been consumed, so the
    /// caller may keep reading.
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>, ReaderError> {
        loop {
            if self.pos >= self.data.len() && !self.advance_file()? {
                return Ok(None);
            }

            let offset = self.pos as u64;
            match JournalEntry::from_bytes(&self.data[self.pos..]) {
                Ok((entry, consumed)) => {
                    self.pos += consumed;

                    if !entry.verify_checksum() {
                        self.record_corruption(
                            offset,
                            CorruptionKind::ChecksumMismatch,
                            format!(
                                "CRC32C mismatch for seq={}, stored={:#010x}",
                                entry.sequence, entry.checksum
                            ),
                        );
                        return Err(ReaderError::ChecksumMismatch {
                            offset,
                            sequence: entry.sequence,
                        });
                    }

                    if let Some(prev) = self.last_sequence {
                        if entry.sequence <= prev {
                            return Err(ReaderError::NotMonotonic {
                                prev,
                                current: entry.sequence,
                            });
                        }
                    }

                    self.last_sequence = Some(entry.sequence);
                    return Ok(Some(entry));
                }
                Err(err) => {
                    let remaining = self.data.len() - self.pos;
                    self.record_corruption(
                        offset,
                        CorruptionKind::TruncatedEntry,
                        format!("{} trailing bytes unreadable: {}", remaining, err),
                    );
                    // Nothing after a torn frame in this file can be trusted
                    self.pos = self.data.len();
                }
            }
        }
    }

    /// Read as many valid entries as possible, skipping damaged frames.
    ///
    /// Returns the valid entries in order plus the corruption log.
    pub fn recover_entries(&mut self) -> (Vec<JournalEntry>, Vec<CorruptionRecord>) {
        let mut entries = Vec::new();
        loop {
            match self.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch { .. }) => continue,
                Err(err) => {
                    warn!(error = %err, "Journal replay stopped early");
                    break;
                }
            }
        }
        (entries, self.corruption_log.clone())
    }

    /// Replay every valid entry of `record_type`, decoded as `T`.
    ///
    /// Entries that fail to decode are reported in the corruption log and
    /// skipped.
    pub fn replay<T: DeserializeOwned>(
        &mut self,
        record_type: &str,
    ) -> (Vec<(u64, T)>, Vec<CorruptionRecord>) {
        let (entries, mut corruption) = self.recover_entries();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.record_type != record_type {
                continue;
            }
            match entry.decode::<T>() {
                Ok(record) => records.push((entry.sequence, record)),
                Err(err) => corruption.push(CorruptionRecord {
                    file: self.current_file().unwrap_or_default(),
                    byte_offset: 0,
                    kind: CorruptionKind::UndecodableRecord,
                    detail: format!("seq={} failed to decode: {}", entry.sequence, err),
                }),
            }
        }
        (records, corruption)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn current_file(&self) -> Option<PathBuf> {
        self.files.get(self.current_file_idx).cloned()
    }

    fn record_corruption(&mut self, byte_offset: u64, kind: CorruptionKind, detail: String) {
        let file = self.current_file().unwrap_or_default();
        warn!(
            file = %file.display(),
            byte_offset,
            kind = ?kind,
            %detail,
            "Journal corruption detected"
        );
        self.corruption_log.push(CorruptionRecord {
            file,
            byte_offset,
            kind,
            detail,
        });
    }

    fn advance_file(&mut self) -> Result<bool, ReaderError> {
        loop {
            if self.current_file_idx + 1 >= self.files.len() {
                return Ok(false);
            }
            self.current_file_idx += 1;
            self.data = fs::read(&self.files[self.current_file_idx])?;
            self.pos = 0;
            if !self.data.is_empty() {
                return Ok(true);
            }
        }
    }

    fn discover_files(dir: &Path) -> Result<Vec<PathBuf>, ReaderError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let idx = JournalWriter::parse_index(&e.file_name().to_string_lossy())?;
                Some((idx, e.path()))
            })
            .collect();

        files.sort_by_key(|(idx, _)| *idx);
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
