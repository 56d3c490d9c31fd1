//! Messages as they travel through the pipeline.
//!
//! - `RawMessage` - bytes as received, before any codec has looked at them
//! - `MessageEvent` - the reusable ring buffer slot carrying a raw message or its journal form
//! - `Message` - what a codec produced, handed to the processing pipeline

mod event;
mod wire;

pub use event::MessageEvent;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SluiceError};

/// Codec name used when a producer does not pick one.
pub const DEFAULT_CODEC: &str = "raw";

pub const FIELD_REMOTE_IP: &str = "remote_ip";
pub const FIELD_REMOTE_PORT: &str = "remote_port";

/// Source recorded when neither the codec nor the remote address supplies one.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// 128-bit message identity.
///
/// Generated ids put the creation time (unix microseconds) in the high 64 bits and
/// a per-process random salt plus a counter in the low 64, so they sort roughly by
/// receive time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u128);

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);
static ID_SALT: OnceLock<u32> = OnceLock::new();

impl MessageId {
    pub fn generate() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let salt = *ID_SALT.get_or_init(rand::random::<u32>);
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let low = ((salt as u64) << 32) | counter as u64;
        Self(((micros as u128) << 64) | low as u128)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Big-endian identity bytes, as stored in journal entries.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            SluiceError::decode(format!("message id must be 16 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(u128::from_be_bytes(bytes)))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A message exactly as it was received.
pub struct RawMessage {
    id: MessageId,
    payload: Vec<u8>,
    timestamp: SystemTime,
    remote: Option<SocketAddr>,
    codec: String,
    journal_offset: Option<u64>,
    encoded: OnceLock<Vec<u8>>,
}

impl RawMessage {
    /// A new message with a fresh id, the current time and the default codec.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::generate(),
            payload: payload.into(),
            timestamp: SystemTime::now(),
            remote: None,
            codec: DEFAULT_CODEC.to_string(),
            journal_offset: None,
            encoded: OnceLock::new(),
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self.encoded = OnceLock::new();
        self
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self.encoded = OnceLock::new();
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self.encoded = OnceLock::new();
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self.encoded = OnceLock::new();
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn id_bytes(&self) -> [u8; 16] {
        self.id.to_bytes()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// Offset of the journal entry this message was read back from, if any.
    pub fn journal_offset(&self) -> Option<u64> {
        self.journal_offset
    }

    pub fn set_journal_offset(&mut self, offset: u64) {
        self.journal_offset = Some(offset);
    }

    /// Journal form of this message, computed on first use.
    pub fn encode(&self) -> Result<&[u8]> {
        if let Some(bytes) = self.encoded.get() {
            return Ok(bytes);
        }
        let bytes = wire::encode(self)?;
        Ok(self.encoded.get_or_init(|| bytes))
    }

    /// Consume the message into `(identity bytes, journal form)`.
    pub fn into_journal_form(mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let encoded = match self.encoded.take() {
            Some(bytes) => bytes,
            None => wire::encode(&self)?,
        };
        Ok((self.id.to_bytes().to_vec(), encoded))
    }

    /// Rebuild a message from its journal form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        wire::decode(bytes)
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("id", &self.id)
            .field("codec", &self.codec)
            .field("remote", &self.remote)
            .field("payload_len", &self.payload.len())
            .field("journal_offset", &self.journal_offset)
            .finish()
    }
}

/// A value stored in a decoded message field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => f.write_str(v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    message: String,
    source: String,
    timestamp: SystemTime,
    receive_time: Option<SystemTime>,
    journal_offset: Option<u64>,
    fields: BTreeMap<String, FieldValue>,
}

impl Message {
    pub fn new(id: MessageId, message: impl Into<String>, timestamp: SystemTime) -> Self {
        Self {
            id,
            message: message.into(),
            source: String::new(),
            timestamp,
            receive_time: None,
            journal_offset: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn receive_time(&self) -> Option<SystemTime> {
        self.receive_time
    }

    pub fn set_receive_time(&mut self, receive_time: SystemTime) {
        self.receive_time = Some(receive_time);
    }

    pub fn journal_offset(&self) -> Option<u64> {
        self.journal_offset
    }

    pub fn set_journal_offset(&mut self, offset: Option<u64>) {
        self.journal_offset = offset;
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// A message without a body is not worth processing.
    pub fn is_complete(&self) -> bool {
        !self.message.trim().is_empty()
    }

    /// Attach receive-side metadata from the raw message it was decoded from.
    pub fn apply_receive_metadata(&mut self, raw: &RawMessage) {
        self.journal_offset = raw.journal_offset();

        if let Some(remote) = raw.remote() {
            let ip = remote.ip().to_string();
            self.add_field(FIELD_REMOTE_IP, ip.as_str());
            if remote.port() > 0 {
                self.add_field(FIELD_REMOTE_PORT, remote.port());
            }
            if self.source.is_empty() {
                self.source = ip;
            }
        }

        if self.source.is_empty() {
            self.source = UNKNOWN_SOURCE.to_string();
        }

        self.receive_time = Some(raw.timestamp());
    }
}
