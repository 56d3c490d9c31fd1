use std::fmt;

use crate::disruptor::RingBufferEntry;
use crate::message::RawMessage;

/// Ring buffer slot shared by every stage.
///
/// Holds either the raw message or, once encoded for the journal, its identity
/// bytes and journal form. Setting the journal form drops the raw message.
#[derive(Default)]
pub struct MessageEvent {
    raw: Option<RawMessage>,
    id_bytes: Option<Vec<u8>>,
    encoded: Option<Vec<u8>>,
}

impl MessageEvent {
    pub fn set_raw(&mut self, raw: RawMessage) {
        self.raw = Some(raw);
    }

    pub fn raw(&self) -> Option<&RawMessage> {
        self.raw.as_ref()
    }

    pub fn take_raw(&mut self) -> Option<RawMessage> {
        self.raw.take()
    }

    pub fn clear_raw(&mut self) {
        self.raw = None;
    }

    pub fn set_journal_form(&mut self, id_bytes: Vec<u8>, encoded: Vec<u8>) {
        self.raw = None;
        self.id_bytes = Some(id_bytes);
        self.encoded = Some(encoded);
    }

    pub fn id_bytes(&self) -> Option<&[u8]> {
        self.id_bytes.as_deref()
    }

    pub fn encoded(&self) -> Option<&[u8]> {
        self.encoded.as_deref()
    }

    /// Move the journal form out, or `None` if either half is missing.
    pub fn take_journal_form(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let id_bytes = self.id_bytes.take();
        let encoded = self.encoded.take();
        id_bytes.zip(encoded)
    }
}

impl RingBufferEntry for MessageEvent {
    fn reset(&mut self) {
        self.raw = None;
        self.id_bytes = None;
        self.encoded = None;
    }
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("raw", &self.raw)
            .field("id_len", &self.id_bytes.as_ref().map(|b| b.len()))
            .field("encoded_len", &self.encoded.as_ref().map(|b| b.len()))
            .finish()
    }
}
