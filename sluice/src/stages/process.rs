//! Ring B and the decode workers draining it.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::codec::CodecRegistry;
use crate::disruptor::{EventHandler, RingBuffer, Sequence};
use crate::error::Result;
use crate::journal::Journal;
use crate::message::{Message, MessageEvent, RawMessage};
use crate::metrics::PipelineMetrics;

/// Downstream consumer of decoded messages.
pub trait ProcessingPipeline: Send + Sync {
    fn handle(&self, message: Message) -> Result<()>;
}

/// Entry point into ring B.
#[derive(Clone)]
pub struct ProcessBuffer {
    ring: Arc<RingBuffer<MessageEvent>>,
}

impl ProcessBuffer {
    pub fn new(ring: Arc<RingBuffer<MessageEvent>>) -> Self {
        Self { ring }
    }

    /// Insert a message, blocking while the ring is full.
    pub fn insert_blocking(&self, raw: RawMessage) -> Result<()> {
        self.ring.publish_with(|event| event.set_raw(raw))?;
        Ok(())
    }

    pub fn usage(&self) -> usize {
        self.ring.capacity() - self.ring.remaining_capacity()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.ring.remaining_capacity()
    }

    pub(crate) fn ring(&self) -> &Arc<RingBuffer<MessageEvent>> {
        &self.ring
    }
}

impl fmt::Debug for ProcessBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBuffer")
            .field("capacity", &self.capacity())
            .field("usage", &self.usage())
            .finish()
    }
}

/// Decodes raw messages and hands them to the processing pipeline.
///
/// The message's journal offset is committed however the event ends: handed on,
/// dropped, failed, or panicked.
pub struct DecodingHandler {
    codecs: Arc<CodecRegistry>,
    output: Arc<dyn ProcessingPipeline>,
    journal: Option<Arc<dyn Journal>>,
    metrics: Arc<PipelineMetrics>,
}

impl DecodingHandler {
    pub fn new(
        codecs: Arc<CodecRegistry>,
        output: Arc<dyn ProcessingPipeline>,
        journal: Option<Arc<dyn Journal>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            codecs,
            output,
            journal,
            metrics,
        }
    }

    fn process(&self, raw: &RawMessage) -> Result<()> {
        let Some(codec) = self.codecs.get(raw.codec()) else {
            self.metrics.record_unknown_codec(1);
            warn!(codec = raw.codec(), id = %raw.id(), "Couldn't find codec, skipping message");
            return Ok(());
        };

        let parse_started = Instant::now();
        let decoded = codec.decode_messages(raw);
        self.metrics.record_parse_time(parse_started.elapsed());
        let messages = match decoded {
            Ok(messages) if messages.is_empty() => {
                self.metrics.record_decode_failure(1);
                debug!(codec = raw.codec(), id = %raw.id(), "Codec produced no message, dropping it");
                return Ok(());
            }
            Ok(messages) => messages,
            Err(err) => {
                self.metrics.record_decode_failure(1);
                return Err(err);
            }
        };

        self.metrics.record_decoded_bytes(raw.size() as u64);
        let mut failure = None;
        for mut message in messages {
            if !message.is_complete() {
                self.metrics.record_incomplete(1);
                debug!(
                    codec = raw.codec(),
                    id = %raw.id(),
                    fields = ?message.fields(),
                    "Dropping incomplete message"
                );
                continue;
            }

            message.apply_receive_metadata(raw);
            self.metrics.record_decoded(1);
            // Later messages are still handed off after a failure
            if let Err(err) = self.output.handle(message) {
                failure.get_or_insert(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

struct CommitOnDrop<'a> {
    journal: Option<&'a Arc<dyn Journal>>,
    offset: Option<u64>,
}

impl Drop for CommitOnDrop<'_> {
    fn drop(&mut self) {
        if let (Some(journal), Some(offset)) = (self.journal, self.offset) {
            journal.mark_journal_offset_committed(offset);
        }
    }
}

impl EventHandler<MessageEvent> for DecodingHandler {
    fn on_event(&mut self, event: &mut MessageEvent, sequence: Sequence, _end_of_batch: bool) -> Result<()> {
        let Some(raw) = event.raw() else {
            debug!(sequence, "Event carries no raw message");
            return Ok(());
        };

        let started = Instant::now();
        {
            let _commit = CommitOnDrop {
                journal: self.journal.as_ref(),
                offset: raw.journal_offset(),
            };
            if let Err(err) = self.process(raw) {
                error!(sequence, raw = ?raw, "Error processing message: {}", err);
            }
        }
        self.metrics.record_decode_time(started.elapsed());
        // Only cleared on a normal return so a panic reaches the fault handler with
        // the message still in the slot.
        event.clear_raw();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, RawCodec};
    use crate::error::SluiceError;
    use crate::journal::InMemoryJournal;
    use crate::message::{FieldValue, FIELD_REMOTE_IP};
    use parking_lot::Mutex;
    use std::time::SystemTime;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Message>>);

    impl ProcessingPipeline for Collect {
        fn handle(&self, message: Message) -> Result<()> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    struct Broken;

    impl Codec for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn decode(&self, _raw: &RawMessage) -> Result<Option<Message>> {
            Err(SluiceError::decode("unexpected token"))
        }
    }

    struct Blank;

    impl Codec for Blank {
        fn name(&self) -> &str {
            "blank"
        }

        fn decode(&self, raw: &RawMessage) -> Result<Option<Message>> {
            Ok(Some(Message::new(raw.id(), "", SystemTime::now())))
        }
    }

    struct Exploding;

    impl Codec for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn decode(&self, _raw: &RawMessage) -> Result<Option<Message>> {
            panic!("codec bug")
        }
    }

    /// Three messages per payload, the middle one blank.
    struct Batch;

    impl Codec for Batch {
        fn name(&self) -> &str {
            "batch"
        }

        fn decode(&self, raw: &RawMessage) -> Result<Option<Message>> {
            Ok(self.decode_messages(raw)?.into_iter().next())
        }

        fn decode_messages(&self, raw: &RawMessage) -> Result<Vec<Message>> {
            Ok(["first", " ", "third"]
                .iter()
                .map(|text| Message::new(raw.id(), *text, raw.timestamp()))
                .collect())
        }
    }

    struct Fixture {
        handler: DecodingHandler,
        output: Arc<Collect>,
        journal: Arc<InMemoryJournal>,
        metrics: Arc<PipelineMetrics>,
    }

    fn fixture() -> Fixture {
        let mut codecs = CodecRegistry::new();
        codecs.register(Arc::new(RawCodec));
        codecs.register(Arc::new(Broken));
        codecs.register(Arc::new(Blank));
        codecs.register(Arc::new(Exploding));
        codecs.register(Arc::new(Batch));
        let output = Arc::new(Collect::default());
        let journal = Arc::new(InMemoryJournal::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let handler = DecodingHandler::new(
            Arc::new(codecs),
            output.clone(),
            Some(journal.clone()),
            metrics.clone(),
        );
        Fixture {
            handler,
            output,
            journal,
            metrics,
        }
    }

    fn event(codec: &str, offset: u64) -> MessageEvent {
        let mut raw = RawMessage::new(b"connection reset".to_vec())
            .with_codec(codec)
            .with_remote("172.16.0.9:6000".parse().unwrap());
        raw.set_journal_offset(offset);
        let mut event = MessageEvent::default();
        event.set_raw(raw);
        event
    }

    #[test]
    fn test_decodes_and_commits() {
        let mut f = fixture();
        let mut ev = event("raw", 3);
        f.handler.on_event(&mut ev, 0, true).unwrap();

        assert!(ev.raw().is_none());
        let out = f.output.0.lock();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message(), "connection reset");
        assert_eq!(out[0].source(), "172.16.0.9");
        assert_eq!(out[0].field(FIELD_REMOTE_IP), Some(&FieldValue::from("172.16.0.9")));
        assert_eq!(out[0].journal_offset(), Some(3));
        assert_eq!(f.journal.committed_offset(), Some(3));
        assert_eq!(f.metrics.decoded_messages(), 1);
    }

    #[test]
    fn test_multi_message_payload_drops_incomplete_ones() {
        let mut f = fixture();
        f.handler.on_event(&mut event("batch", 6), 0, true).unwrap();

        let out = f.output.0.lock();
        let texts: Vec<_> = out.iter().map(|m| m.message()).collect();
        assert_eq!(texts, vec!["first", "third"]);
        assert!(out
            .iter()
            .all(|m| m.journal_offset() == Some(6) && m.source() == "172.16.0.9"));
        assert_eq!(f.metrics.decoded_messages(), 2);
        assert_eq!(f.metrics.incomplete_messages(), 1);
        assert_eq!(f.metrics.decode_failures(), 0);
        assert_eq!(f.journal.committed_offset(), Some(6));
    }

    #[test]
    fn test_decode_and_parse_time_are_recorded() {
        let mut f = fixture();
        f.handler.on_event(&mut event("raw", 0), 0, false).unwrap();
        f.handler.on_event(&mut event("broken", 1), 1, false).unwrap();
        f.handler.on_event(&mut event("gelf", 2), 2, true).unwrap();

        assert_eq!(f.metrics.decode_time().count(), 3);
        // No codec ran for the unknown one
        assert_eq!(f.metrics.parse_time().count(), 2);
        assert!(f.metrics.decode_time().total() >= f.metrics.parse_time().total());
    }

    #[test]
    #[traced_test]
    fn test_unknown_codec_is_skipped_and_committed() {
        let mut f = fixture();
        f.handler.on_event(&mut event("gelf", 5), 0, true).unwrap();

        assert!(f.output.0.lock().is_empty());
        assert_eq!(f.journal.committed_offset(), Some(5));
        assert_eq!(f.metrics.unknown_codec(), 1);
        assert!(logs_contain("Couldn't find codec"));
    }

    #[test]
    #[traced_test]
    fn test_decode_failure_is_isolated() {
        let mut f = fixture();
        f.handler.on_event(&mut event("broken", 1), 0, false).unwrap();
        f.handler.on_event(&mut event("raw", 2), 1, true).unwrap();

        assert_eq!(f.output.0.lock().len(), 1);
        assert_eq!(f.metrics.decode_failures(), 1);
        assert_eq!(f.journal.committed_offset(), Some(2));
        assert!(logs_contain("Error processing message"));
    }

    #[test]
    fn test_incomplete_message_is_dropped() {
        let mut f = fixture();
        f.handler.on_event(&mut event("blank", 4), 0, true).unwrap();

        assert!(f.output.0.lock().is_empty());
        assert_eq!(f.metrics.incomplete_messages(), 1);
        assert_eq!(f.journal.committed_offset(), Some(4));
    }

    #[test]
    fn test_panicking_codec_still_commits() {
        let mut f = fixture();
        let mut ev = event("exploding", 8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f.handler.on_event(&mut ev, 0, true)
        }));
        assert!(result.is_err());
        assert_eq!(f.journal.committed_offset(), Some(8));
        assert_eq!(ev.raw().map(|raw| raw.journal_offset()), Some(Some(8)));
        assert!(format!("{:?}", ev).contains("codec: \"exploding\""));
    }

    #[test]
    fn test_insert_blocking_and_usage() {
        let ring = Arc::new(
            RingBuffer::with_wait_strategy(4, crate::disruptor::WaitStrategyKind::Blocking.build())
                .unwrap(),
        );
        let gate = Arc::new(crate::disruptor::Cursor::new(0));
        ring.add_gating_cursors(&[gate.clone()]);
        let buffer = ProcessBuffer::new(ring);

        buffer.insert_blocking(RawMessage::new(b"a".to_vec())).unwrap();
        buffer.insert_blocking(RawMessage::new(b"b".to_vec())).unwrap();
        assert_eq!(buffer.usage(), 2);
        assert_eq!(buffer.remaining_capacity(), 2);
        gate.set(2);
        assert_eq!(buffer.usage(), 0);
    }
}
