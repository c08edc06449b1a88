//! Self-describing binary encoding for the tether wire protocol.
//!
//! Every payload that crosses a session is one [`Value`] — a closed set of
//! thirteen kinds, each with a stable one-byte discriminant. Encoded values
//! carry their own type information, so the two peers never exchange a
//! schema: the first byte of an encoding names the kind, and containers
//! recursively tag their elements.
//!
//! | Module          | Contents                                        |
//! |-----------------|-------------------------------------------------|
//! | [`serialize`]   | [`Value::encode`] / [`Value::to_bytes`]         |
//! | [`deserialize`] | [`Cursor`], [`Value::decode`] / [`Value::from_bytes`] |
//!
//! ```rust
//! use tether_wire::Value;
//!
//! let v = Value::List(vec![
//!     Value::from(1i64),
//!     Value::from("ab"),
//!     Value::Bool(true),
//!     Value::Null,
//! ]);
//! let bytes = v.to_bytes().unwrap();
//! assert_eq!(Value::from_bytes(&bytes).unwrap(), v);
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod serialize;

pub use deserialize::{Cursor, DecodeError};
pub use serialize::EncodeError;

use num_bigint::BigInt;

/// Upper bound, in bytes, of every variable-length field in an encoding:
/// integer magnitudes, string/byte lengths and container element counts.
/// Mappings are capped at half of this ([`MAX_MAP_LEN`]) since each entry
/// encodes two values.
pub const MAX_LEN: usize = 64 * 1024 - 1;

/// Maximum number of key/value pairs in an encoded mapping.
pub const MAX_MAP_LEN: usize = MAX_LEN / 2;

/// One-byte kind discriminants as they appear on the wire.
///
/// `0` is reserved for an application-defined extension point and `254`/`255`
/// for future use; decoding any of them fails with
/// [`DecodeError::UnknownDiscriminant`].
pub mod disc {
    pub const INT: u8 = 1;
    pub const STR: u8 = 2;
    pub const BOOL: u8 = 3;
    pub const TUPLE: u8 = 4;
    pub const LIST: u8 = 5;
    pub const MAP: u8 = 6;
    pub const SET: u8 = 7;
    pub const COMPLEX: u8 = 8;
    pub const FLOAT: u8 = 9;
    pub const BYTES: u8 = 10;
    pub const BYTE_ARRAY: u8 = 11;
    pub const FROZEN_SET: u8 = 12;
    pub const NULL: u8 = 13;
}

/// A dynamically-typed wire value.
///
/// The unordered kinds ([`Value::Set`], [`Value::FrozenSet`], [`Value::Map`])
/// are stored in insertion order and compare element-wise; their encoding is
/// deterministic for a given in-memory order but carries no ordering
/// guarantee across peers.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Arbitrary-precision signed integer (up to [`MAX_LEN`] magnitude bytes).
    Int(BigInt),
    /// UTF-8 string.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Fixed-arity ordered sequence, distinct from [`Value::List`].
    Tuple(Vec<Value>),
    /// Ordered sequence.
    List(Vec<Value>),
    /// Key/value mapping, kept in insertion order.
    Map(Vec<(Value, Value)>),
    /// Unordered collection.
    Set(Vec<Value>),
    /// Complex number as a pair of doubles.
    Complex {
        /// Real part.
        re: f64,
        /// Imaginary part.
        im: f64,
    },
    /// IEEE-754 double.
    Float(f64),
    /// Immutable byte string.
    Bytes(Vec<u8>),
    /// Mutable byte buffer; decodes to an independently ownable buffer.
    ByteArray(Vec<u8>),
    /// Immutable unordered collection.
    FrozenSet(Vec<Value>),
    /// The null singleton; carries no payload bytes.
    Null,
}

impl Value {
    /// The wire discriminant for this value's kind.
    pub fn discriminant(&self) -> u8 {
        match self {
            Value::Int(_) => disc::INT,
            Value::Str(_) => disc::STR,
            Value::Bool(_) => disc::BOOL,
            Value::Tuple(_) => disc::TUPLE,
            Value::List(_) => disc::LIST,
            Value::Map(_) => disc::MAP,
            Value::Set(_) => disc::SET,
            Value::Complex { .. } => disc::COMPLEX,
            Value::Float(_) => disc::FLOAT,
            Value::Bytes(_) => disc::BYTES,
            Value::ByteArray(_) => disc::BYTE_ARRAY,
            Value::FrozenSet(_) => disc::FROZEN_SET,
            Value::Null => disc::NULL,
        }
    }
}

// ─── Conversions ──────────────────────────────────────────────────────────────

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(BigInt::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(BigInt::from(n))
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
