//! Decoding of self-describing binary data back into [`Value`]s.

use std::fmt;

use num_bigint::BigInt;

use crate::{MAX_MAP_LEN, Value, disc};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur during decoding. All of them render the current
/// frame malformed; the session layer treats that as fatal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// The leading byte does not name a recognised kind.
    UnknownDiscriminant {
        /// The offending byte.
        disc: u8,
    },
    /// A string payload was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnknownDiscriminant { disc } => {
                write!(f, "unknown kind discriminant: {disc:#04x}")
            }
            Self::InvalidUtf8 => write!(f, "string payload is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Specialized `Result` for decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy cursor over an in-memory byte slice.
///
/// Only the three [`DecodeError`] cases can ever occur during decoding, so
/// this avoids `std::io::Cursor` and its wide error surface.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        match self.buf.get(self.pos).copied() {
            Some(b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(DecodeError::UnexpectedEof),
        }
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        if end > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    /// Read up to `n` bytes, stopping early at the end of the buffer.
    ///
    /// Byte-string payloads use this: a declared length beyond the available
    /// data truncates rather than failing.
    pub fn read_up_to(&mut self, n: usize) -> &'a [u8] {
        let end = (self.pos + n).min(self.buf.len());
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        slice
    }

    /// Read a big-endian `u16` length or count field.
    pub fn read_u16_be(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_f64_be(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(f64::from_be_bytes(b))
    }
}

// ─── Decoding ────────────────────────────────────────────────────────────────

impl Value {
    /// Read one value from `buf`, advancing its position.
    pub fn decode(buf: &mut Cursor<'_>) -> Result<Value> {
        let disc = buf.read_byte()?;
        Ok(match disc {
            disc::INT => {
                let len = buf.read_u16_be()? as usize;
                let mut raw = vec![0u8; len];
                buf.read_exact(&mut raw)?;
                Value::Int(BigInt::from_signed_bytes_be(&raw))
            }
            disc::STR => {
                let len = buf.read_u16_be()? as usize;
                let raw = buf.read_up_to(len);
                match std::str::from_utf8(raw) {
                    Ok(s) => Value::Str(s.to_owned()),
                    Err(_) => return Err(DecodeError::InvalidUtf8),
                }
            }
            disc::BOOL => Value::Bool(buf.read_byte()? != 0),
            disc::TUPLE => Value::Tuple(decode_values(buf)?),
            disc::LIST => Value::List(decode_values(buf)?),
            disc::MAP => {
                let count = buf.read_u16_be()? as usize;
                // Encoders never produce more, but a forged count is harmless
                // here: decoding simply fails on the exhausted stream.
                let mut pairs = Vec::with_capacity(count.min(MAX_MAP_LEN));
                for _ in 0..count {
                    let key = Value::decode(buf)?;
                    let value = Value::decode(buf)?;
                    pairs.push((key, value));
                }
                Value::Map(pairs)
            }
            disc::SET => Value::Set(decode_values(buf)?),
            disc::COMPLEX => Value::Complex {
                re: buf.read_f64_be()?,
                im: buf.read_f64_be()?,
            },
            disc::FLOAT => Value::Float(buf.read_f64_be()?),
            disc::BYTES => {
                let len = buf.read_u16_be()? as usize;
                Value::Bytes(buf.read_up_to(len).to_vec())
            }
            disc::BYTE_ARRAY => {
                let len = buf.read_u16_be()? as usize;
                Value::ByteArray(buf.read_up_to(len).to_vec())
            }
            disc::FROZEN_SET => Value::FrozenSet(decode_values(buf)?),
            disc::NULL => Value::Null,
            other => return Err(DecodeError::UnknownDiscriminant { disc: other }),
        })
    }

    /// Convenience: decode a single value from a byte slice.
    ///
    /// Trailing bytes after the value are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
        let mut cursor = Cursor::from_slice(bytes);
        Value::decode(&mut cursor)
    }
}

fn decode_values(buf: &mut Cursor<'_>) -> Result<Vec<Value>> {
    let count = buf.read_u16_be()? as usize;
    let mut items = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        items.push(Value::decode(buf)?);
    }
    Ok(items)
}
