//! Disk payload codec.
//!
//! Every value persisted to the disk store is a self-describing byte
//! payload carrying the value body, an optional expiry trailer, and an
//! integrity footer:
//!
//! ```text
//! [type_tag u8][type body][0xFC][expire_ms i64 le]  (trailer optional)
//! [version u16 le][crc32 u32 le]
//! ```
//!
//! Bodies use a deterministic little-endian wire format: byte strings are
//! `[u32 len][bytes]`, collections are `[u32 count][item…]`, and sorted-set
//! scores are `f64` bit patterns. All lengths are `u32`, limiting a single
//! item to 4 GiB, which matches the disk store's value-size ceiling.
//!
//! The CRC32 footer covers every byte before the checksum itself.
//! [`verify`] must be called on any payload read back from disk before
//! [`decode`]; a payload that fails either is treated by callers as
//! "key absent from disk", never as a fatal error.


use thiserror::Error;

use crate::value::{Value, ValueKind};

/// Opcode introducing the expiry trailer, carried over from the dump
/// format the original payloads were written in.
pub const EXPIRE_OPCODE: u8 = 0xFC;

/// Current payload format version.
pub const PAYLOAD_VERSION: u16 = 1;

/// Footer size: version (2) + CRC32 (4).
const FOOTER_LEN: usize = 6;

/// Expiry trailer size: opcode (1) + millisecond deadline (8).
const EXPIRE_TRAILER_LEN: usize = 9;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding or verifying a disk payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The buffer ended before decoding completed.
    #[error("payload truncated (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// The type tag byte was not a known value kind.
    #[error("unknown value type tag: {0}")]
    UnknownTypeTag(u8),

    /// The CRC32 footer did not match the payload contents.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    /// The version field named a format this build does not understand.
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u16),

    /// Bytes remained between the value body and the footer that were not
    /// a well-formed expiry trailer.
    #[error("unexpected trailing bytes in payload")]
    TrailingBytes,
}

// ------------------------------------------------------------------------------------------------
// Encoding
// ------------------------------------------------------------------------------------------------

/// Encodes a value and optional expiry deadline into a disk payload.
///
/// The output is deterministic: the same value and expiry always produce
/// the same bytes. Individual byte strings longer than `u32::MAX` cannot
/// be represented; the disk store rejects such values before they reach
/// this codec, so the length conversion asserts rather than erroring.
pub fn encode(value: &Value, expire_ms: Option<i64>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(value.kind() as u8);

    match value {
        Value::Str(bytes) => put_bytes(&mut buf, bytes),
        Value::List(items) => {
            put_u32(&mut buf, count_u32(items.len()));
            for item in items {
                put_bytes(&mut buf, item);
            }
        }
        Value::Set(members) => {
            put_u32(&mut buf, count_u32(members.len()));
            for member in members {
                put_bytes(&mut buf, member);
            }
        }
        Value::ZSet(members) => {
            put_u32(&mut buf, count_u32(members.len()));
            for (member, score) in members {
                put_bytes(&mut buf, member);
                buf.extend_from_slice(&score.to_bits().to_le_bytes());
            }
        }
        Value::Hash(fields) => {
            put_u32(&mut buf, count_u32(fields.len()));
            for (field, val) in fields {
                put_bytes(&mut buf, field);
                put_bytes(&mut buf, val);
            }
        }
    }

    if let Some(when) = expire_ms {
        buf.push(EXPIRE_OPCODE);
        buf.extend_from_slice(&when.to_le_bytes());
    }

    buf.extend_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

// ------------------------------------------------------------------------------------------------
// Verification and decoding
// ------------------------------------------------------------------------------------------------

/// Checks the integrity footer of a payload.
///
/// Validates that the buffer is long enough to hold a footer and that the
/// trailing CRC32 matches the rest of the buffer.
pub fn verify(buf: &[u8]) -> Result<(), PayloadError> {
    if buf.len() < FOOTER_LEN + 1 {
        return Err(PayloadError::Truncated {
            needed: FOOTER_LEN + 1,
            available: buf.len(),
        });
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32fast::hash(body) != stored {
        return Err(PayloadError::ChecksumMismatch);
    }
    Ok(())
}

/// Decodes a payload into its value and optional expiry deadline.
///
/// Assumes [`verify`] has already passed; still bounds-checks every read
/// so a malformed buffer produces an error rather than a panic.
pub fn decode(buf: &[u8]) -> Result<(Value, Option<i64>), PayloadError> {
    if buf.len() < FOOTER_LEN + 1 {
        return Err(PayloadError::Truncated {
            needed: FOOTER_LEN + 1,
            available: buf.len(),
        });
    }
    let body_end = buf.len() - FOOTER_LEN;
    let version = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    if version != PAYLOAD_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }

    let mut cur = Cursor::new(&buf[..body_end]);
    let tag = cur.u8()?;
    let kind = ValueKind::from_tag(tag).map_err(|e| PayloadError::UnknownTypeTag(e.0))?;

    let value = match kind {
        ValueKind::Str => Value::Str(cur.bytes()?),
        ValueKind::List => {
            let count = cur.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(cur.remaining()));
            for _ in 0..count {
                items.push(cur.bytes()?);
            }
            Value::List(items)
        }
        ValueKind::Set => {
            let count = cur.u32()? as usize;
            let mut members = std::collections::BTreeSet::new();
            for _ in 0..count {
                members.insert(cur.bytes()?);
            }
            Value::Set(members)
        }
        ValueKind::ZSet => {
            let count = cur.u32()? as usize;
            let mut members = std::collections::BTreeMap::new();
            for _ in 0..count {
                let member = cur.bytes()?;
                let score = f64::from_bits(cur.u64()?);
                members.insert(member, score);
            }
            Value::ZSet(members)
        }
        ValueKind::Hash => {
            let count = cur.u32()? as usize;
            let mut fields = std::collections::BTreeMap::new();
            for _ in 0..count {
                let field = cur.bytes()?;
                let val = cur.bytes()?;
                fields.insert(field, val);
            }
            Value::Hash(fields)
        }
    };

    let expire = match cur.remaining() {
        0 => None,
        EXPIRE_TRAILER_LEN => {
            if cur.u8()? != EXPIRE_OPCODE {
                return Err(PayloadError::TrailingBytes);
            }
            Some(cur.i64()?)
        }
        _ => return Err(PayloadError::TrailingBytes),
    };

    Ok((value, expire))
}

// ------------------------------------------------------------------------------------------------
// Wire primitives
// ------------------------------------------------------------------------------------------------

fn put_u32(buf: &mut Vec<u8>, n: u32) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, count_u32(bytes.len()));
    buf.extend_from_slice(bytes);
}

fn count_u32(len: usize) -> u32 {
    u32::try_from(len).expect("item exceeds the 4 GiB payload item limit")
}

/// Bounds-checked reader over a payload body.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        if self.remaining() < n {
            return Err(PayloadError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PayloadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PayloadError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64, PayloadError> {
        Ok(self.u64()? as i64)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, PayloadError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
