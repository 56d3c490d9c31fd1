//! Single consumer that persists encoded events.
//!
//! Events are collected until the processor reports the end of a batch, then
//! written in one `Journal::write` call. A failed write is retried with
//! exponential backoff until it succeeds; there is no attempt limit, so a journal
//! outage backs pressure up to the producers instead of losing messages.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::BackoffConfig;
use crate::disruptor::{EventHandler, Sequence};
use crate::error::Result;
use crate::journal::{Journal, JournalEntry, JournalSignal};
use crate::message::MessageEvent;
use crate::metrics::PipelineMetrics;

/// Delay sequence for retries: `initial`, then multiplied each attempt, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: Duration::ZERO,
            attempts: 0,
            config,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            self.config.initial
        } else {
            self.current.saturating_mul(self.config.multiplier)
        };
        self.current = delay.min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);
        self.current
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = Duration::ZERO;
    }
}

type Sleeper = Box<dyn Fn(Duration) + Send>;

pub struct JournalWriter {
    journal: Arc<dyn Journal>,
    signal: Arc<JournalSignal>,
    metrics: Arc<PipelineMetrics>,
    backoff: Backoff,
    sleeper: Sleeper,
    pending: Vec<(Sequence, Option<(Vec<u8>, Vec<u8>)>)>,
}

impl JournalWriter {
    pub fn new(
        journal: Arc<dyn Journal>,
        signal: Arc<JournalSignal>,
        metrics: Arc<PipelineMetrics>,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            journal,
            signal,
            metrics,
            backoff: Backoff::new(retry),
            sleeper: Box::new(std::thread::sleep),
            pending: Vec::new(),
        }
    }

    /// Replace the function used to wait between retries.
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + 'static,
    {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Events collected since the last batch boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self) {
        let journal = &self.journal;
        let entries: Vec<JournalEntry> = self
            .pending
            .drain(..)
            .filter_map(|(sequence, form)| match form {
                Some((id, encoded)) => Some(journal.create_entry(id, encoded)),
                None => {
                    warn!(sequence, "Event has no journal form, skipping it");
                    None
                }
            })
            .collect();

        if entries.is_empty() {
            return;
        }
        self.write_with_retry(&entries);
    }

    fn write_with_retry(&mut self, entries: &[JournalEntry]) {
        loop {
            match self.journal.write(entries) {
                Ok(offset) => {
                    debug!(entries = entries.len(), offset, "Wrote batch to journal");
                    self.metrics.record_journal_batch(1);
                    self.metrics.record_journal_entries(entries.len() as u64);
                    self.signal.release();
                    self.backoff.reset();
                    return;
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    self.metrics.record_journal_write_failure(1);
                    error!(
                        attempt = self.backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        entries = entries.len(),
                        "Unable to write to journal, retrying: {}",
                        err
                    );
                    (self.sleeper)(delay);
                }
            }
        }
    }
}

impl EventHandler<MessageEvent> for JournalWriter {
    fn on_event(&mut self, event: &mut MessageEvent, sequence: Sequence, end_of_batch: bool) -> Result<()> {
        self.pending.push((sequence, event.take_journal_form()));
        if end_of_batch {
            self.flush();
        }
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<()> {
        self.flush();
        Ok(())
    }
}

impl fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalWriter")
            .field("pending", &self.pending.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
