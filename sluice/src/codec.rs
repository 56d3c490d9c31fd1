//! Codecs turn raw payloads into messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::{Message, RawMessage, DEFAULT_CODEC};

pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Decode one raw message. `Ok(None)` means the payload carried nothing worth keeping.
    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>>;

    /// Decode a payload that may carry several messages, such as a batch of
    /// records in one datagram. Defaults to `decode`.
    fn decode_messages(&self, raw: &RawMessage) -> Result<Vec<Message>> {
        Ok(self.decode(raw)?.into_iter().collect())
    }
}

/// Treats the payload as a UTF-8 text line.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &str {
        DEFAULT_CODEC
    }

    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>> {
        let text = String::from_utf8_lossy(raw.payload());
        let text = text.trim_end_matches(&['\r', '\n', '\0'][..]);
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(Message::new(raw.id(), text, raw.timestamp())))
    }
}

/// Splits the payload on newlines, one message per non-empty line.
///
/// Every message shares the raw message's id, so downstream consumers that
/// dedupe by id see one delivery per raw message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinesCodec;

pub const LINES_CODEC: &str = "lines";

impl Codec for LinesCodec {
    fn name(&self) -> &str {
        LINES_CODEC
    }

    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>> {
        Ok(self.decode_messages(raw)?.into_iter().next())
    }

    fn decode_messages(&self, raw: &RawMessage) -> Result<Vec<Message>> {
        let text = String::from_utf8_lossy(raw.payload());
        Ok(text
            .split('\n')
            .map(|line| line.trim_end_matches(&['\r', '\0'][..]))
            .filter(|line| !line.is_empty())
            .map(|line| Message::new(raw.id(), line, raw.timestamp()))
            .collect())
    }
}

/// Codecs by name.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(LinesCodec));
        registry
    }

    /// Add `codec`, replacing any codec registered under the same name.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(codec.name().to_string(), codec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(name)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.codecs.keys().collect();
        names.sort();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}
