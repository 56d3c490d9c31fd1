//! Feeds journaled messages back into the process buffer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::{Result, SluiceError};
use crate::journal::{Journal, JournalReadEntry, JournalSignal};
use crate::message::RawMessage;
use crate::metrics::PipelineMetrics;
use crate::stages::ProcessBuffer;

/// Background thread reading the journal into ring B.
///
/// Wakes on each write signal, or every poll interval without one. After `stop` it
/// keeps reading until the journal has nothing left, then exits.
pub struct JournalReader {
    stop: Arc<AtomicBool>,
    signal: Arc<JournalSignal>,
    handle: Option<JoinHandle<()>>,
}

struct ReaderLoop {
    journal: Arc<dyn Journal>,
    signal: Arc<JournalSignal>,
    output: ProcessBuffer,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl JournalReader {
    pub fn spawn(
        journal: Arc<dyn Journal>,
        signal: Arc<JournalSignal>,
        output: ProcessBuffer,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(SluiceError::config("Journal read batch size must be greater than 0"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let reader = ReaderLoop {
            journal,
            signal: signal.clone(),
            output,
            metrics,
            batch_size,
            poll_interval,
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("journal-reader".to_string())
            .spawn(move || reader.run())?;

        info!(batch_size, poll_ms = poll_interval.as_millis() as u64, "Journal reader started");
        Ok(Self {
            stop,
            signal,
            handle: Some(handle),
        })
    }

    /// Drain what is left in the journal, then stop the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // wake a reader parked on the signal
        self.signal.release();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Journal reader terminated abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for JournalReader {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for JournalReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalReader")
            .field("running", &self.is_running())
            .finish()
    }
}

impl ReaderLoop {
    fn run(self) {
        // A full read means the journal may hold more, so skip the wait next round.
        let mut backlog = false;
        loop {
            let stopping = self.stop.load(Ordering::Acquire);
            if !stopping && !backlog {
                self.signal.acquire_timeout(self.poll_interval);
            }

            match self.journal.read(self.batch_size) {
                Ok(entries) if entries.is_empty() => {
                    backlog = false;
                    if stopping {
                        break;
                    }
                }
                Ok(entries) => {
                    backlog = entries.len() >= self.batch_size;
                    debug!(entries = entries.len(), backlog, "Read batch from journal");
                    for entry in entries {
                        if self.forward(entry).is_err() {
                            error!("Process buffer is shut down, journal reader exiting");
                            return;
                        }
                    }
                }
                Err(err) => {
                    backlog = false;
                    error!("Unable to read from journal: {}", err);
                    if stopping {
                        break;
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        }
        debug!("Journal reader stopped");
    }

    fn forward(&self, entry: JournalReadEntry) -> Result<()> {
        match RawMessage::decode(&entry.payload) {
            Ok(mut raw) => {
                raw.set_journal_offset(entry.offset);
                self.output.insert_blocking(raw)
            }
            Err(err) => {
                self.metrics.record_decode_failure(1);
                error!(offset = entry.offset, "Skipping unreadable journal entry: {}", err);
                self.journal.mark_journal_offset_committed(entry.offset);
                Ok(())
            }
        }
    }
}
