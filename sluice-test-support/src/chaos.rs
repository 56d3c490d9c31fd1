//! Failure injection for journals.
//!
//! `FlakyJournal` wraps any journal and fails writes according to a
//! `FailurePattern`. Failed writes never reach the inner journal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use sluice::{InMemoryJournal, Journal, JournalEntry, JournalReadEntry, Result, SluiceError};

/// When a write should fail.
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePattern {
    /// Never fail
    None,
    /// Fail the first `count` writes, then succeed
    FirstN { count: u64 },
    /// Fail each write with the given probability (0.0-1.0)
    Random { probability: f64 },
    /// Fail every write until told otherwise
    Always,
}

/// One call to `FlakyJournal::write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttempt {
    pub entries: usize,
    pub succeeded: bool,
}

/// Journal that fails on demand.
///
/// # Example
///
/// ```
/// use sluice::{Journal, JournalEntry};
/// use sluice_test_support::chaos::{FailurePattern, FlakyJournal};
///
/// let journal = FlakyJournal::in_memory(FailurePattern::FirstN { count: 1 });
/// let entry = JournalEntry::new(vec![1; 16], b"payload".to_vec());
/// assert!(journal.write(&[entry.clone()]).is_err());
/// assert_eq!(journal.write(&[entry]).unwrap(), 0);
/// ```
pub struct FlakyJournal<J = InMemoryJournal> {
    inner: Arc<J>,
    pattern: Mutex<FailurePattern>,
    failures: AtomicU64,
    attempts: Mutex<Vec<WriteAttempt>>,
    write_delay: Option<Duration>,
}

impl FlakyJournal<InMemoryJournal> {
    pub fn in_memory(pattern: FailurePattern) -> Self {
        Self::new(Arc::new(InMemoryJournal::new()), pattern)
    }
}

impl<J: Journal> FlakyJournal<J> {
    pub fn new(inner: Arc<J>, pattern: FailurePattern) -> Self {
        Self {
            inner,
            pattern: Mutex::new(pattern),
            failures: AtomicU64::new(0),
            attempts: Mutex::new(Vec::new()),
            write_delay: None,
        }
    }

    /// Sleep before every write, successful or not.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn inner(&self) -> &Arc<J> {
        &self.inner
    }

    pub fn set_pattern(&self, pattern: FailurePattern) {
        *self.pattern.lock() = pattern;
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> Vec<WriteAttempt> {
        self.attempts.lock().clone()
    }

    fn should_fail(&self) -> bool {
        let mut pattern = self.pattern.lock();
        match &mut *pattern {
            FailurePattern::None => false,
            FailurePattern::Always => true,
            FailurePattern::FirstN { count } => {
                if *count == 0 {
                    return false;
                }
                *count -= 1;
                true
            }
            FailurePattern::Random { probability } => {
                rand::thread_rng().gen::<f64>() < probability.clamp(0.0, 1.0)
            }
        }
    }
}

impl<J: Journal> Journal for FlakyJournal<J> {
    fn write(&self, entries: &[JournalEntry]) -> Result<u64> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.attempts.lock().push(WriteAttempt {
                entries: entries.len(),
                succeeded: false,
            });
            return Err(SluiceError::journal("injected write failure"));
        }
        let offset = self.inner.write(entries)?;
        self.attempts.lock().push(WriteAttempt {
            entries: entries.len(),
            succeeded: true,
        });
        Ok(offset)
    }

    fn read(&self, max_entries: usize) -> Result<Vec<JournalReadEntry>> {
        self.inner.read(max_entries)
    }

    fn mark_journal_offset_committed(&self, offset: u64) {
        self.inner.mark_journal_offset_committed(offset)
    }

    fn committed_offset(&self) -> Option<u64> {
        self.inner.committed_offset()
    }

    fn uncommitted_entries(&self) -> u64 {
        self.inner.uncommitted_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> JournalEntry {
        JournalEntry::new(vec![7; 16], b"data".to_vec())
    }

    #[test]
    fn test_no_failures() {
        let journal = FlakyJournal::in_memory(FailurePattern::None);
        for _ in 0..100 {
            assert!(journal.write(&[entry()]).is_ok());
        }
        assert_eq!(journal.failures(), 0);
        assert_eq!(journal.inner().write_count(), 100);
    }

    #[test]
    fn test_first_n_failures() {
        let journal = FlakyJournal::in_memory(FailurePattern::FirstN { count: 3 });
        let results: Vec<bool> = (0..5).map(|_| journal.write(&[entry()]).is_ok()).collect();
        assert_eq!(results, vec![false, false, false, true, true]);
        assert_eq!(journal.failures(), 3);
        assert_eq!(journal.inner().next_offset(), 2);
    }

    #[test]
    fn test_always_then_recover() {
        let journal = FlakyJournal::in_memory(FailurePattern::Always);
        assert!(journal.write(&[entry(), entry()]).is_err());
        journal.set_pattern(FailurePattern::None);
        assert_eq!(journal.write(&[entry(), entry()]).unwrap(), 1);
        assert_eq!(
            journal.attempts(),
            vec![
                WriteAttempt {
                    entries: 2,
                    succeeded: false
                },
                WriteAttempt {
                    entries: 2,
                    succeeded: true
                },
            ]
        );
    }

    #[test]
    fn test_random_failures_trigger() {
        let journal = FlakyJournal::in_memory(FailurePattern::Random { probability: 0.5 });
        for _ in 0..1000 {
            let _ = journal.write(&[entry()]);
        }
        assert!(journal.failures() > 0);
        assert!(journal.failures() < 1000);
    }
}
