//! On-disk layout.
//!
//! ```text
//! header (64 bytes)
//!   0  magic        u64
//!   8  version      u32
//!  12  reserved     u32
//!  16  write_pos    u64   end of the last complete frame
//!  24  next_offset  u64   offset the next entry will receive
//!  32  committed    u64   first uncommitted offset
//!  40  padding
//!
//! frame
//!   [len u32][crc u32][offset u64][id_len u16][id][payload]
//!   len and crc cover everything after the 8-byte frame header
//! ```
//!
//! All integers are little-endian.

use crate::JournalError;

pub(crate) const MAGIC: u64 = 0x004a_4543_4955_4c53; // "SLUICEJ\0"
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 64;
pub(crate) const FRAME_HEADER_SIZE: usize = 8;
/// offset + id_len
const BODY_PREFIX: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub write_pos: u64,
    pub next_offset: u64,
    pub committed: u64,
}

impl Header {
    pub fn empty() -> Self {
        Self {
            write_pos: HEADER_SIZE as u64,
            next_offset: 0,
            committed: 0,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..16].fill(0);
        buf[16..24].copy_from_slice(&self.write_pos.to_le_bytes());
        buf[24..32].copy_from_slice(&self.next_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.committed.to_le_bytes());
        buf[40..HEADER_SIZE].fill(0);
    }

    pub fn read_from(buf: &[u8]) -> Result<Self, JournalError> {
        if buf.len() < HEADER_SIZE {
            return Err(JournalError::InvalidMagic);
        }
        if read_u64(buf, 0) != MAGIC {
            return Err(JournalError::InvalidMagic);
        }
        let version = read_u32(buf, 8);
        if version != VERSION {
            return Err(JournalError::UnsupportedVersion(version));
        }
        Ok(Self {
            write_pos: read_u64(buf, 16),
            next_offset: read_u64(buf, 24),
            committed: read_u64(buf, 32),
        })
    }
}

/// Bytes a frame for this entry occupies.
pub(crate) fn frame_len(id: &[u8], payload: &[u8]) -> usize {
    FRAME_HEADER_SIZE + BODY_PREFIX + id.len() + payload.len()
}

/// Write one frame at `pos`. The caller has checked that it fits.
pub(crate) fn write_frame(buf: &mut [u8], pos: usize, offset: u64, id: &[u8], payload: &[u8]) -> usize {
    let body_start = pos + FRAME_HEADER_SIZE;
    let id_start = body_start + BODY_PREFIX;
    let payload_start = id_start + id.len();
    let end = payload_start + payload.len();

    buf[body_start..body_start + 8].copy_from_slice(&offset.to_le_bytes());
    buf[body_start + 8..id_start].copy_from_slice(&(id.len() as u16).to_le_bytes());
    buf[id_start..payload_start].copy_from_slice(id);
    buf[payload_start..end].copy_from_slice(payload);

    let body_len = (end - body_start) as u32;
    let checksum = crc32fast::hash(&buf[body_start..end]);
    buf[pos..pos + 4].copy_from_slice(&body_len.to_le_bytes());
    buf[pos + 4..body_start].copy_from_slice(&checksum.to_le_bytes());
    end
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame<'a> {
    Valid {
        offset: u64,
        id: &'a [u8],
        payload: &'a [u8],
        end: usize,
    },
    /// Length is plausible but the contents fail validation
    Corrupt { end: usize },
    /// Not enough bytes before `limit` for a frame
    Truncated,
}

/// Parse the frame starting at `pos`, never looking past `limit`.
pub(crate) fn read_frame(buf: &[u8], pos: usize, limit: usize) -> Frame<'_> {
    if pos + FRAME_HEADER_SIZE > limit {
        return Frame::Truncated;
    }
    let body_len = read_u32(buf, pos) as usize;
    let body_start = pos + FRAME_HEADER_SIZE;
    let end = body_start + body_len;
    if body_len < BODY_PREFIX || end > limit {
        return Frame::Truncated;
    }

    let body = &buf[body_start..end];
    if crc32fast::hash(body) != read_u32(buf, pos + 4) {
        return Frame::Corrupt { end };
    }
    let id_len = u16::from_le_bytes([body[8], body[9]]) as usize;
    if BODY_PREFIX + id_len > body.len() {
        return Frame::Corrupt { end };
    }

    Frame::Valid {
        offset: read_u64(body, 0),
        id: &body[BODY_PREFIX..BODY_PREFIX + id_len],
        payload: &body[BODY_PREFIX + id_len..],
        end,
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut buf = [0u8; HEADER_SIZE];
        let header = Header {
            write_pos: 4096,
            next_offset: 17,
            committed: 12,
        };
        header.write_to(&mut buf);
        assert_eq!(Header::read_from(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_foreign_file() {
        let buf = [0xABu8; HEADER_SIZE];
        assert!(matches!(Header::read_from(&buf), Err(JournalError::InvalidMagic)));

        let mut buf = [0u8; HEADER_SIZE];
        Header::empty().write_to(&mut buf);
        buf[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Header::read_from(&buf),
            Err(JournalError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_frame_write_then_read() {
        let mut buf = vec![0u8; 256];
        let end = write_frame(&mut buf, 16, 42, b"id-bytes", b"payload");
        assert_eq!(end, 16 + frame_len(b"id-bytes", b"payload"));

        match read_frame(&buf, 16, buf.len()) {
            Frame::Valid {
                offset,
                id,
                payload,
                end: frame_end,
            } => {
                assert_eq!(offset, 42);
                assert_eq!(id, b"id-bytes");
                assert_eq!(payload, b"payload");
                assert_eq!(frame_end, end);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut buf = vec![0u8; 128];
        let end = write_frame(&mut buf, 0, 1, b"id", b"hello");
        buf[end - 1] ^= 0xFF;
        assert_eq!(read_frame(&buf, 0, buf.len()), Frame::Corrupt { end });
    }

    #[test]
    fn test_frame_past_limit_is_truncated() {
        let mut buf = vec![0u8; 128];
        let end = write_frame(&mut buf, 0, 1, b"id", b"hello");
        assert_eq!(read_frame(&buf, 0, end - 1), Frame::Truncated);
        // Zeroed space after the last frame
        assert_eq!(read_frame(&buf, end, buf.len()), Frame::Truncated);
    }
}
