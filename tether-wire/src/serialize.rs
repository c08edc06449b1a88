//! Encoding of [`Value`]s into their self-describing binary form.
//!
//! Layout per kind (after the one-byte discriminant):
//!
//! | Kind           | Payload                                              |
//! |----------------|------------------------------------------------------|
//! | integer        | `u16_be(len)` ‖ two's-complement big-endian bytes    |
//! | string         | `u16_be(len)` ‖ UTF-8 bytes                          |
//! | boolean        | one byte, `0x00` or `0x01`                           |
//! | float          | 8 bytes IEEE-754, big-endian                         |
//! | complex        | real ‖ imaginary, each as a float payload            |
//! | bytes / bytearray | `u16_be(len)` ‖ bytes                             |
//! | tuple / list / set / frozen set | `u16_be(count)` ‖ encoded elements  |
//! | mapping        | `u16_be(count)` ‖ encoded key/value pairs            |
//! | null           | nothing                                              |
//!
//! Lengths and counts never exceed [`MAX_LEN`] (mappings: [`MAX_MAP_LEN`]);
//! a value that would need more fails with [`EncodeError::TooLarge`].

use std::fmt;

use num_traits::Zero;

use crate::{MAX_LEN, MAX_MAP_LEN, Value};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while encoding a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// A field exceeded the 65535-byte length or element-count limit.
    TooLarge,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge => write!(f, "value too large to encode"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Specialized `Result` for encoding.
pub type Result<T> = std::result::Result<T, EncodeError>;

// ─── Encoding ────────────────────────────────────────────────────────────────

fn put_len(buf: &mut Vec<u8>, len: usize, cap: usize) -> Result<()> {
    if len > cap {
        return Err(EncodeError::TooLarge);
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

fn put_values(buf: &mut Vec<u8>, items: &[Value]) -> Result<()> {
    put_len(buf, items.len(), MAX_LEN)?;
    for item in items {
        item.encode(buf)?;
    }
    Ok(())
}

impl Value {
    /// Append the self-describing encoding of `self` to `buf`.
    ///
    /// On error the buffer may hold a partial encoding; discard it.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.discriminant());
        match self {
            Value::Int(n) => {
                // Minimal two's complement; zero still occupies one byte.
                let raw = if n.is_zero() {
                    vec![0]
                } else {
                    n.to_signed_bytes_be()
                };
                put_len(buf, raw.len(), MAX_LEN)?;
                buf.extend_from_slice(&raw);
            }
            Value::Str(s) => {
                put_len(buf, s.len(), MAX_LEN)?;
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bool(b) => buf.push(u8::from(*b)),
            Value::Tuple(items) | Value::List(items) | Value::Set(items) | Value::FrozenSet(items) => {
                put_values(buf, items)?;
            }
            Value::Map(pairs) => {
                put_len(buf, pairs.len(), MAX_MAP_LEN)?;
                for (key, value) in pairs {
                    key.encode(buf)?;
                    value.encode(buf)?;
                }
            }
            Value::Complex { re, im } => {
                buf.extend_from_slice(&re.to_be_bytes());
                buf.extend_from_slice(&im.to_be_bytes());
            }
            Value::Float(x) => buf.extend_from_slice(&x.to_be_bytes()),
            Value::Bytes(b) | Value::ByteArray(b) => {
                put_len(buf, b.len(), MAX_LEN)?;
                buf.extend_from_slice(b);
            }
            Value::Null => {}
        }
        Ok(())
    }

    /// Convenience: allocate a fresh `Vec<u8>` and encode into it.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}
