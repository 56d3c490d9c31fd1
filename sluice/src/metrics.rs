//! Pipeline counters.
//!
//! Counters are plain atomics read by gauges and tests. An optional `MetricsSink`
//! receives every increment and timing for forwarding elsewhere; a panicking sink
//! is ignored.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const INCOMING_MESSAGES: &str = "incoming_messages";
pub const ENCODED_BYTES: &str = "encoded_bytes";
pub const ENCODE_FAILURES: &str = "encode_failures";
pub const JOURNAL_BATCHES: &str = "journal_batches";
pub const JOURNAL_ENTRIES: &str = "journal_entries";
pub const JOURNAL_WRITE_FAILURES: &str = "journal_write_failures";
pub const DECODED_MESSAGES: &str = "decoded_messages";
pub const DECODED_BYTES: &str = "decoded_bytes";
pub const DECODE_FAILURES: &str = "decode_failures";
pub const INCOMPLETE_MESSAGES: &str = "incomplete_messages";
pub const UNKNOWN_CODEC: &str = "unknown_codec";
/// Whole decode step for one raw message, codec lookup to hand-off
pub const DECODE_TIME: &str = "decode_time";
/// Codec call alone
pub const PARSE_TIME: &str = "parse_time";

/// Receives counter increments and timings. Fire-and-forget.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, value: u64);

    fn record_duration(&self, _name: &'static str, _duration: Duration) {}
}

/// Count, total and maximum of recorded durations.
#[derive(Default)]
pub struct TimerStats {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl TimerStats {
    fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed))
    }

    pub fn mean(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            count => Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed) / count),
        }
    }
}

impl fmt::Debug for TimerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerStats")
            .field("count", &self.count())
            .field("mean", &self.mean())
            .field("max", &self.max())
            .finish()
    }
}

#[derive(Default)]
pub struct PipelineMetrics {
    incoming_messages: AtomicU64,
    encoded_bytes: AtomicU64,
    encode_failures: AtomicU64,
    journal_batches: AtomicU64,
    journal_entries: AtomicU64,
    journal_write_failures: AtomicU64,
    decoded_messages: AtomicU64,
    decoded_bytes: AtomicU64,
    decode_failures: AtomicU64,
    incomplete_messages: AtomicU64,
    unknown_codec: AtomicU64,
    decode_time: TimerStats,
    parse_time: TimerStats,
    sink: Option<Arc<dyn MetricsSink>>,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident, $name:expr) => {
        pub fn $record(&self, value: u64) {
            self.$field.fetch_add(value, Ordering::Relaxed);
            self.forward($name, value);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    counter!(record_incoming, incoming_messages, incoming_messages, INCOMING_MESSAGES);
    counter!(record_encoded_bytes, encoded_bytes, encoded_bytes, ENCODED_BYTES);
    counter!(record_encode_failure, encode_failures, encode_failures, ENCODE_FAILURES);
    counter!(record_journal_batch, journal_batches, journal_batches, JOURNAL_BATCHES);
    counter!(record_journal_entries, journal_entries, journal_entries, JOURNAL_ENTRIES);
    counter!(
        record_journal_write_failure,
        journal_write_failures,
        journal_write_failures,
        JOURNAL_WRITE_FAILURES
    );
    counter!(record_decoded, decoded_messages, decoded_messages, DECODED_MESSAGES);
    counter!(record_decoded_bytes, decoded_bytes, decoded_bytes, DECODED_BYTES);
    counter!(record_decode_failure, decode_failures, decode_failures, DECODE_FAILURES);
    counter!(record_incomplete, incomplete_messages, incomplete_messages, INCOMPLETE_MESSAGES);
    counter!(record_unknown_codec, unknown_codec, unknown_codec, UNKNOWN_CODEC);

    pub fn record_decode_time(&self, duration: Duration) {
        self.decode_time.record(duration);
        self.forward_duration(DECODE_TIME, duration);
    }

    pub fn decode_time(&self) -> &TimerStats {
        &self.decode_time
    }

    pub fn record_parse_time(&self, duration: Duration) {
        self.parse_time.record(duration);
        self.forward_duration(PARSE_TIME, duration);
    }

    pub fn parse_time(&self) -> &TimerStats {
        &self.parse_time
    }

    fn forward(&self, name: &'static str, value: u64) {
        if let Some(sink) = &self.sink {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| sink.increment(name, value)));
        }
    }

    fn forward_duration(&self, name: &'static str, duration: Duration) {
        if let Some(sink) = &self.sink {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| sink.record_duration(name, duration)));
        }
    }
}

impl fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("incoming_messages", &self.incoming_messages())
            .field("encoded_bytes", &self.encoded_bytes())
            .field("journal_batches", &self.journal_batches())
            .field("journal_write_failures", &self.journal_write_failures())
            .field("decoded_messages", &self.decoded_messages())
            .field("decode_failures", &self.decode_failures())
            .field("decode_time", &self.decode_time)
            .finish_non_exhaustive()
    }
}
