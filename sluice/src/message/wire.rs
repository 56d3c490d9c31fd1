//! Journal form of a `RawMessage`.
//!
//! ```text
//! magic "SJ" | version u8 | id 16B BE | timestamp nanos u64
//! | codec len u16 + utf8 | remote tag u8 (0/4/6) + ip + port u16
//! | payload len u32 + bytes | crc32 u32
//! ```
//!
//! Integers are little-endian unless noted. The CRC covers everything before it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::{Duration, UNIX_EPOCH};

use crate::error::{Result, SluiceError};
use crate::message::{MessageId, RawMessage};

const MAGIC: [u8; 2] = *b"SJ";
const VERSION: u8 = 1;
const CRC_SIZE: usize = 4;
const MIN_SIZE: usize = 2 + 1 + 16 + 8 + 2 + 1 + 4 + CRC_SIZE;

const REMOTE_NONE: u8 = 0;
const REMOTE_V4: u8 = 4;
const REMOTE_V6: u8 = 6;

pub(crate) fn encode(raw: &RawMessage) -> Result<Vec<u8>> {
    let codec = raw.codec.as_bytes();
    let codec_len = u16::try_from(codec.len())
        .map_err(|_| SluiceError::encode(format!("codec name too long: {} bytes", codec.len())))?;
    let payload_len = u32::try_from(raw.payload.len()).map_err(|_| {
        SluiceError::encode(format!("payload too large: {} bytes", raw.payload.len()))
    })?;
    let nanos = raw
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut buf = Vec::with_capacity(MIN_SIZE + codec.len() + 18 + raw.payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&raw.id.to_bytes());
    buf.extend_from_slice(&nanos.to_le_bytes());
    buf.extend_from_slice(&codec_len.to_le_bytes());
    buf.extend_from_slice(codec);
    match raw.remote {
        None => buf.push(REMOTE_NONE),
        Some(SocketAddr::V4(addr)) => {
            buf.push(REMOTE_V4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_le_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.push(REMOTE_V6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_le_bytes());
        }
    }
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&raw.payload);

    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<RawMessage> {
    if bytes.len() < MIN_SIZE {
        return Err(SluiceError::decode(format!(
            "journal entry too short: {} bytes",
            bytes.len()
        )));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - CRC_SIZE);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != expected {
        return Err(SluiceError::decode("journal entry checksum mismatch"));
    }

    let mut reader = Reader::new(body);
    if reader.take(2)? != MAGIC {
        return Err(SluiceError::decode("journal entry has invalid magic"));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(SluiceError::decode(format!(
            "unsupported journal entry version {}",
            version
        )));
    }

    let id = MessageId::from_bytes(reader.take(16)?)?;
    let timestamp = UNIX_EPOCH + Duration::from_nanos(reader.u64()?);

    let codec_len = reader.u16()? as usize;
    let codec = std::str::from_utf8(reader.take(codec_len)?)
        .map_err(|_| SluiceError::decode("codec name is not valid UTF-8"))?
        .to_string();

    let remote = match reader.u8()? {
        REMOTE_NONE => None,
        REMOTE_V4 => {
            let octets: [u8; 4] = reader.array()?;
            let port = reader.u16()?;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        REMOTE_V6 => {
            let octets: [u8; 16] = reader.array()?;
            let port = reader.u16()?;
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        tag => {
            return Err(SluiceError::decode(format!("unknown remote address tag {}", tag)));
        }
    };

    let payload_len = reader.u32()? as usize;
    let payload = reader.take(payload_len)?.to_vec();
    if !reader.is_empty() {
        return Err(SluiceError::decode(format!(
            "{} trailing bytes after payload",
            reader.remaining()
        )));
    }

    Ok(RawMessage {
        id,
        payload,
        timestamp,
        remote,
        codec,
        journal_offset: None,
        encoded: OnceLock::new(),
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(SluiceError::decode(format!(
                "journal entry truncated: wanted {} bytes at {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
