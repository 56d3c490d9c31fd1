//! Journal contract and the in-memory implementation.
//!
//! A journal is an append-only log. Writes assign strictly increasing offsets in
//! batch order; reads walk a single read cursor forward; consumers mark offsets
//! committed once a message no longer needs to be replayed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// One entry handed to `Journal::write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    id: Vec<u8>,
    payload: Vec<u8>,
}

impl JournalEntry {
    pub fn new(id: Vec<u8>, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.id.len() + self.payload.len()
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.id, self.payload)
    }
}

/// One entry returned by `Journal::read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReadEntry {
    pub offset: u64,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

pub trait Journal: Send + Sync {
    fn create_entry(&self, id: Vec<u8>, payload: Vec<u8>) -> JournalEntry {
        JournalEntry::new(id, payload)
    }

    /// Append `entries` in order and return the offset of the last one written.
    ///
    /// A failed write must leave the journal as if it never happened, so the caller
    /// can retry the same batch.
    fn write(&self, entries: &[JournalEntry]) -> Result<u64>;

    /// Read up to `max_entries` from the read cursor and advance it.
    fn read(&self, max_entries: usize) -> Result<Vec<JournalReadEntry>>;

    /// Record that everything up to `offset` has been handled. Never moves backwards.
    fn mark_journal_offset_committed(&self, offset: u64);

    fn committed_offset(&self) -> Option<u64>;

    /// Entries written but not yet committed.
    fn uncommitted_entries(&self) -> u64;
}

/// Committed offset as a monotone maximum. Stores `offset + 1`; zero means none.
#[derive(Debug, Default)]
pub struct CommittedOffset(AtomicU64);

impl CommittedOffset {
    pub fn new(initial: Option<u64>) -> Self {
        Self(AtomicU64::new(initial.map_or(0, |offset| offset + 1)))
    }

    pub fn mark(&self, offset: u64) {
        self.0.fetch_max(offset.saturating_add(1), Ordering::AcqRel);
    }

    pub fn get(&self) -> Option<u64> {
        self.0.load(Ordering::Acquire).checked_sub(1)
    }

    /// First offset that is not committed.
    pub fn next_uncommitted(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

struct MemoryLog {
    entries: VecDeque<JournalReadEntry>,
    next_offset: u64,
    read_offset: u64,
    writes: u64,
}

impl MemoryLog {
    fn first_offset(&self) -> u64 {
        self.entries
            .front()
            .map_or(self.next_offset, |entry| entry.offset)
    }
}

/// Journal kept in process memory.
///
/// Entries are dropped once they have been both read and committed.
pub struct InMemoryJournal {
    log: Mutex<MemoryLog>,
    committed: CommittedOffset,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MemoryLog {
                entries: VecDeque::new(),
                next_offset: 0,
                read_offset: 0,
                writes: 0,
            }),
            committed: CommittedOffset::default(),
        }
    }

    /// Successful `write` calls so far.
    pub fn write_count(&self) -> u64 {
        self.log.lock().writes
    }

    /// Next offset the journal will assign.
    pub fn next_offset(&self) -> u64 {
        self.log.lock().next_offset
    }

    /// Entries still held, in offset order.
    pub fn entries(&self) -> Vec<JournalReadEntry> {
        self.log.lock().entries.iter().cloned().collect()
    }

    fn compact(&self) {
        let mut log = self.log.lock();
        let horizon = log.read_offset.min(self.committed.next_uncommitted());
        while log.first_offset() < horizon {
            log.entries.pop_front();
        }
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for InMemoryJournal {
    fn write(&self, entries: &[JournalEntry]) -> Result<u64> {
        let mut log = self.log.lock();
        for entry in entries {
            let offset = log.next_offset;
            log.entries.push_back(JournalReadEntry {
                offset,
                id: entry.id.clone(),
                payload: entry.payload.clone(),
            });
            log.next_offset += 1;
        }
        log.writes += 1;
        Ok(log.next_offset.saturating_sub(1))
    }

    fn read(&self, max_entries: usize) -> Result<Vec<JournalReadEntry>> {
        let mut log = self.log.lock();
        let start = (log.read_offset - log.first_offset()) as usize;
        let batch: Vec<_> = log
            .entries
            .iter()
            .skip(start)
            .take(max_entries)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            log.read_offset = last.offset + 1;
        }
        Ok(batch)
    }

    fn mark_journal_offset_committed(&self, offset: u64) {
        self.committed.mark(offset);
        self.compact();
    }

    fn committed_offset(&self) -> Option<u64> {
        self.committed.get()
    }

    fn uncommitted_entries(&self) -> u64 {
        let next = self.log.lock().next_offset;
        next.saturating_sub(self.committed.next_uncommitted())
    }
}

/// Counting semaphore between the journal writer and the journal reader.
///
/// The writer releases one permit per successful batch; the reader waits on it.
#[derive(Debug, Default)]
pub struct JournalSignal {
    permits: Mutex<u64>,
    cond: Condvar,
}

impl JournalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Wait up to `timeout` for a permit. Returns whether one was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cond.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn available_permits(&self) -> u64 {
        *self.permits.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(n: u8) -> JournalEntry {
        JournalEntry::new(vec![n; 16], vec![n; 4])
    }

    #[test]
    fn test_offsets_increase_in_batch_order() {
        let journal = InMemoryJournal::new();
        assert_eq!(journal.write(&[entry(1), entry(2), entry(3)]).unwrap(), 2);
        assert_eq!(journal.write(&[entry(4)]).unwrap(), 3);
        assert_eq!(journal.write_count(), 2);

        let offsets: Vec<_> = journal.entries().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert_eq!(journal.entries()[3].id, vec![4; 16]);
    }

    #[test]
    fn test_read_advances_cursor() {
        let journal = InMemoryJournal::new();
        journal.write(&[entry(1), entry(2), entry(3)]).unwrap();

        let first = journal.read(2).unwrap();
        assert_eq!(first.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![0, 1]);
        let second = journal.read(10).unwrap();
        assert_eq!(second.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![2]);
        assert!(journal.read(10).unwrap().is_empty());
    }

    #[test]
    fn test_committed_offset_is_monotone() {
        let journal = InMemoryJournal::new();
        journal.write(&[entry(1), entry(2), entry(3), entry(4)]).unwrap();
        assert_eq!(journal.committed_offset(), None);
        assert_eq!(journal.uncommitted_entries(), 4);

        journal.mark_journal_offset_committed(2);
        journal.mark_journal_offset_committed(1);
        assert_eq!(journal.committed_offset(), Some(2));
        assert_eq!(journal.uncommitted_entries(), 1);
    }

    #[test]
    fn test_compaction_keeps_unread_entries() {
        let journal = InMemoryJournal::new();
        journal.write(&[entry(1), entry(2), entry(3)]).unwrap();
        journal.read(1).unwrap();
        journal.mark_journal_offset_committed(2);

        // offset 0 is read and committed, offsets 1 and 2 are still unread
        assert_eq!(journal.entries().len(), 2);
        let rest = journal.read(10).unwrap();
        assert_eq!(rest.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![1, 2]);

        journal.mark_journal_offset_committed(2);
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_signal_permits() {
        let signal = JournalSignal::new();
        assert!(!signal.try_acquire());
        signal.release();
        signal.release();
        assert_eq!(signal.available_permits(), 2);
        assert!(signal.try_acquire());
        assert!(signal.acquire_timeout(Duration::from_millis(1)));
        assert!(!signal.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(JournalSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.release();
        assert!(waiter.join().unwrap());
        assert_eq!(signal.available_permits(), 0);
    }
}
