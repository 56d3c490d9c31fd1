//! Memory-mapped journal.
//!
//! One fixed-size file. Frames are appended after the header; the header is
//! rewritten after every batch. Frames that have been both read and committed are
//! reclaimed by sliding the live tail back to the front of the file when a batch
//! would not otherwise fit.
//!
//! On open the log is scanned from the start. The first frame that fails
//! validation ends the log, and reading resumes at the first uncommitted offset,
//! so anything in flight at a crash is delivered again.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use sluice::journal::CommittedOffset;
use sluice::{Journal, JournalEntry, JournalReadEntry};
use tracing::{debug, info, warn};

use crate::format::{self, Frame, Header, FRAME_HEADER_SIZE, HEADER_SIZE};
use crate::JournalError;

const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MmapJournalOptions {
    /// File size in bytes, header included
    pub capacity: usize,
    /// msync written frames before `write` returns
    pub flush_on_write: bool,
}

impl Default for MmapJournalOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            flush_on_write: false,
        }
    }
}

/// A frame handed out by `read` that has not been reclaimed yet.
#[derive(Debug, Clone, Copy)]
struct Retained {
    offset: u64,
    end: usize,
    /// Failed validation; reclaimed without waiting for a commit
    corrupt: bool,
}

struct Log {
    mmap: MmapMut,
    _file: File,
    write_pos: usize,
    read_pos: usize,
    /// Start of the oldest frame still needed
    retained_pos: usize,
    retained: VecDeque<Retained>,
    next_offset: u64,
    /// Offset the next valid frame at `read_pos` is expected to carry
    read_offset: u64,
}

impl Log {
    fn capacity(&self) -> usize {
        self.mmap.len()
    }

    fn sync_header(&mut self, committed: u64) {
        Header {
            write_pos: self.write_pos as u64,
            next_offset: self.next_offset,
            committed,
        }
        .write_to(&mut self.mmap[..HEADER_SIZE]);
    }

    /// Drop frames below `horizon` from the retained queue.
    fn release(&mut self, horizon: u64) {
        while let Some(front) = self.retained.front() {
            if !front.corrupt && front.offset >= horizon {
                break;
            }
            self.retained_pos = front.end;
            self.retained.pop_front();
        }
    }

    /// Move the live region `[retained_pos, write_pos)` to the front of the file.
    fn compact(&mut self, horizon: u64) -> usize {
        self.release(horizon);
        let shift = self.retained_pos - HEADER_SIZE;
        if shift == 0 {
            return 0;
        }
        self.mmap
            .copy_within(self.retained_pos..self.write_pos, HEADER_SIZE);
        self.write_pos -= shift;
        self.read_pos -= shift;
        self.retained_pos = HEADER_SIZE;
        for frame in &mut self.retained {
            frame.end -= shift;
        }
        shift
    }
}

/// Crash-recoverable journal in a single memory-mapped file.
pub struct MmapJournal {
    log: Mutex<Log>,
    committed: CommittedOffset,
    path: PathBuf,
    flush_on_write: bool,
}

impl MmapJournal {
    /// Create a new journal, replacing any file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, options: MmapJournalOptions) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if options.capacity < HEADER_SIZE + FRAME_HEADER_SIZE {
            return Err(JournalError::InvalidCapacity(options.capacity));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(options.capacity as u64)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Header::empty().write_to(&mut mmap[..HEADER_SIZE]);
        mmap.flush_range(0, HEADER_SIZE)?;

        info!(path = %path.display(), capacity = options.capacity, "Created journal");
        Ok(Self {
            log: Mutex::new(Log {
                mmap,
                _file: file,
                write_pos: HEADER_SIZE,
                read_pos: HEADER_SIZE,
                retained_pos: HEADER_SIZE,
                retained: VecDeque::new(),
                next_offset: 0,
                read_offset: 0,
            }),
            committed: CommittedOffset::default(),
            path,
            flush_on_write: options.flush_on_write,
        })
    }

    /// Open an existing journal and recover its state. Capacity is taken from the
    /// file; `options.capacity` is ignored.
    pub fn open<P: AsRef<Path>>(path: P, options: MmapJournalOptions) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let header = Header::read_from(&mmap)?;

        let limit = (header.write_pos as usize).clamp(HEADER_SIZE, mmap.len());
        let mut pos = HEADER_SIZE;
        let mut next_offset = header.next_offset;
        // First frame at or past the committed offset
        let mut resume: Option<(usize, u64)> = None;
        let mut frames = 0u64;
        loop {
            match format::read_frame(&mmap, pos, limit) {
                Frame::Valid { offset, end, .. } => {
                    if resume.is_none() && offset >= header.committed {
                        resume = Some((pos, offset));
                    }
                    next_offset = next_offset.max(offset + 1);
                    frames += 1;
                    pos = end;
                }
                Frame::Corrupt { .. } | Frame::Truncated => break,
            }
        }
        if pos < limit {
            warn!(
                path = %path.display(),
                valid_bytes = pos,
                discarded_bytes = limit - pos,
                "Journal ends in an unreadable frame, truncating"
            );
        }

        let write_pos = pos;
        let (read_pos, read_offset) = resume.unwrap_or((write_pos, next_offset));
        let committed = CommittedOffset::new(header.committed.checked_sub(1));
        let mut log = Log {
            mmap,
            _file: file,
            write_pos,
            read_pos,
            retained_pos: read_pos,
            retained: VecDeque::new(),
            next_offset,
            read_offset,
        };
        log.sync_header(committed.next_uncommitted());

        info!(
            path = %path.display(),
            frames,
            next_offset,
            uncommitted = next_offset.saturating_sub(committed.next_uncommitted()),
            "Opened journal"
        );
        Ok(Self {
            log: Mutex::new(log),
            committed,
            path,
            flush_on_write: options.flush_on_write,
        })
    }

    /// Open `path` if it exists, create it otherwise.
    pub fn open_or_create<P: AsRef<Path>>(path: P, options: MmapJournalOptions) -> Result<Self, JournalError> {
        if path.as_ref().exists() {
            Self::open(path, options)
        } else {
            Self::create(path, options)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.log.lock().capacity()
    }

    /// Bytes held by frames, read or not.
    pub fn used_bytes(&self) -> usize {
        let log = self.log.lock();
        log.write_pos - log.retained_pos
    }

    pub fn next_offset(&self) -> u64 {
        self.log.lock().next_offset
    }

    pub fn flush(&self) -> Result<(), JournalError> {
        let mut log = self.log.lock();
        log.sync_header(self.committed.next_uncommitted());
        log.mmap.flush()?;
        Ok(())
    }

    fn append(&self, entries: &[JournalEntry]) -> Result<u64, JournalError> {
        let mut log = self.log.lock();
        let max_frame = log.capacity() - HEADER_SIZE;

        let mut batch = Vec::with_capacity(entries.len());
        let mut needed = 0usize;
        for entry in entries {
            let len = format::frame_len(entry.id(), entry.payload());
            if len > max_frame || entry.id().len() > u16::MAX as usize {
                warn!(
                    frame_bytes = len,
                    max_frame,
                    "Entry can never fit in the journal, skipping it"
                );
                continue;
            }
            needed += len;
            batch.push(entry);
        }

        if log.write_pos + needed > log.capacity() {
            let committed = self.committed.next_uncommitted();
            let compact_to = committed.min(log.read_offset);
            let reclaimed = log.compact(compact_to);
            if reclaimed > 0 {
                // frames moved; the old write position now points past live data
                log.sync_header(committed);
                debug!(reclaimed, "Compacted journal");
            }
            if log.write_pos + needed > log.capacity() {
                return Err(JournalError::Full {
                    needed,
                    available: log.capacity() - log.write_pos,
                });
            }
        }

        let start = log.write_pos;
        let mut pos = start;
        for entry in batch {
            let offset = log.next_offset;
            pos = format::write_frame(&mut log.mmap, pos, offset, entry.id(), entry.payload());
            log.next_offset += 1;
        }
        log.write_pos = pos;
        log.sync_header(self.committed.next_uncommitted());

        if self.flush_on_write && pos > start {
            log.mmap.flush_range(start, pos - start)?;
            log.mmap.flush_range(0, HEADER_SIZE)?;
        }
        Ok(log.next_offset.saturating_sub(1))
    }
}

impl Journal for MmapJournal {
    fn write(&self, entries: &[JournalEntry]) -> sluice::Result<u64> {
        Ok(self.append(entries)?)
    }

    fn read(&self, max_entries: usize) -> sluice::Result<Vec<JournalReadEntry>> {
        let mut log = self.log.lock();
        let mut out = Vec::with_capacity(max_entries.min(1024));
        while out.len() < max_entries && log.read_pos < log.write_pos {
            let pos = log.read_pos;
            let limit = log.write_pos;
            match format::read_frame(&log.mmap, pos, limit) {
                Frame::Valid {
                    offset,
                    id,
                    payload,
                    end,
                } => {
                    out.push(JournalReadEntry {
                        offset,
                        id: id.to_vec(),
                        payload: payload.to_vec(),
                    });
                    log.retained.push_back(Retained {
                        offset,
                        end,
                        corrupt: false,
                    });
                    log.read_pos = end;
                    log.read_offset = offset + 1;
                }
                Frame::Corrupt { end } => {
                    warn!(position = pos, "Skipping corrupted journal frame");
                    let offset = log.read_offset;
                    log.retained.push_back(Retained {
                        offset,
                        end,
                        corrupt: true,
                    });
                    log.read_pos = end;
                    log.read_offset += 1;
                }
                Frame::Truncated => {
                    return Err(JournalError::Corrupted(pos).into());
                }
            }
        }
        Ok(out)
    }

    fn mark_journal_offset_committed(&self, offset: u64) {
        self.committed.mark(offset);
    }

    fn committed_offset(&self) -> Option<u64> {
        self.committed.get()
    }

    fn uncommitted_entries(&self) -> u64 {
        let next = self.log.lock().next_offset;
        next.saturating_sub(self.committed.next_uncommitted())
    }
}

impl Drop for MmapJournal {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), "Unable to flush journal on close: {}", err);
        }
    }
}

impl std::fmt::Debug for MmapJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.lock();
        f.debug_struct("MmapJournal")
            .field("path", &self.path)
            .field("capacity", &log.capacity())
            .field("write_pos", &log.write_pos)
            .field("read_pos", &log.read_pos)
            .field("next_offset", &log.next_offset)
            .field("committed", &self.committed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn entry(n: u8) -> JournalEntry {
        JournalEntry::new(vec![n; 16], vec![n; 32])
    }

    fn small() -> MmapJournalOptions {
        MmapJournalOptions {
            capacity: 4096,
            flush_on_write: true,
        }
    }

    #[test]
    fn test_write_read_commit() {
        let dir = tempdir().unwrap();
        let journal = MmapJournal::create(dir.path().join("j.log"), small()).unwrap();

        assert_eq!(journal.write(&[entry(1), entry(2), entry(3)]).unwrap(), 2);
        let read = journal.read(2).unwrap();
        assert_eq!(read.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(read[1].payload, vec![2; 32]);
        assert_eq!(journal.read(10).unwrap().len(), 1);
        assert!(journal.read(10).unwrap().is_empty());

        assert_eq!(journal.uncommitted_entries(), 3);
        journal.mark_journal_offset_committed(2);
        journal.mark_journal_offset_committed(0);
        assert_eq!(journal.committed_offset(), Some(2));
        assert_eq!(journal.uncommitted_entries(), 0);
    }

    #[test]
    fn test_full_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let journal = MmapJournal::create(dir.path().join("j.log"), small()).unwrap();
        let frame = format::frame_len(&[0; 16], &[0; 32]);
        let fits = (4096 - HEADER_SIZE) / frame;

        let batch: Vec<_> = (0..fits).map(|i| entry(i as u8)).collect();
        journal.write(&batch).unwrap();
        let before = journal.next_offset();

        let err = journal.write(&[entry(9), entry(9)]).unwrap_err();
        assert!(err.to_string().contains("journal full"));
        assert_eq!(journal.next_offset(), before);
    }

    #[test]
    fn test_compaction_reclaims_committed_frames() {
        let dir = tempdir().unwrap();
        let journal = MmapJournal::create(dir.path().join("j.log"), small()).unwrap();
        let frame = format::frame_len(&[0; 16], &[0; 32]);
        let fits = (4096 - HEADER_SIZE) / frame;

        for round in 0..5u64 {
            let batch: Vec<_> = (0..fits).map(|i| entry(i as u8)).collect();
            let last = journal.write(&batch).unwrap();
            let read = journal.read(fits).unwrap();
            assert_eq!(read.len(), fits);
            assert_eq!(read[0].offset, round * fits as u64);
            journal.mark_journal_offset_committed(last);
        }
        assert_eq!(journal.next_offset(), 5 * fits as u64);
    }

    #[test]
    fn test_unread_frames_are_not_reclaimed() {
        let dir = tempdir().unwrap();
        let journal = MmapJournal::create(dir.path().join("j.log"), small()).unwrap();
        let frame = format::frame_len(&[0; 16], &[0; 32]);
        let fits = (4096 - HEADER_SIZE) / frame;

        let batch: Vec<_> = (0..fits).map(|i| entry(i as u8)).collect();
        journal.write(&batch).unwrap();
        // Committed but never read: still needed
        journal.mark_journal_offset_committed(fits as u64 - 1);
        assert!(journal.write(&[entry(1)]).is_err());

        journal.read(fits).unwrap();
        assert!(journal.write(&[entry(1)]).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_oversized_entry_is_skipped() {
        let dir = tempdir().unwrap();
        let journal = MmapJournal::create(dir.path().join("j.log"), small()).unwrap();
        let huge = JournalEntry::new(vec![0; 16], vec![0; 8192]);

        assert_eq!(journal.write(&[entry(1), huge, entry(2)]).unwrap(), 1);
        let read = journal.read(10).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].payload, vec![2; 32]);
        assert!(logs_contain("Entry can never fit in the journal"));
    }

    #[test]
    fn test_tiny_capacity_rejected() {
        let dir = tempdir().unwrap();
        let options = MmapJournalOptions {
            capacity: 16,
            flush_on_write: false,
        };
        assert!(matches!(
            MmapJournal::create(dir.path().join("j.log"), options),
            Err(JournalError::InvalidCapacity(16))
        ));
    }
}
