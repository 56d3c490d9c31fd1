//! Durable journal for sluice, backed by a memory-mapped file.
//!
//! - `MmapJournal` - fixed-capacity log with crash recovery and sliding compaction

mod format;
mod mmap;

pub use mmap::{MmapJournal, MmapJournalOptions};

use sluice::SluiceError;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal full: batch needs {needed} bytes, {available} available")]
    Full { needed: usize, available: usize },
    #[error("corrupted frame at byte {0}")]
    Corrupted(usize),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported journal version {0}")]
    UnsupportedVersion(u32),
    #[error("capacity {0} is too small for a journal")]
    InvalidCapacity(usize),
}

impl From<JournalError> for SluiceError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Io(err) => SluiceError::Io(err),
            other => SluiceError::journal(other.to_string()),
        }
    }
}
