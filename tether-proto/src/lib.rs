//! The tether session protocol.
//!
//! Everything the two sides of a session share, independent of which end
//! accepted the connection:
//!
//! | Module        | Contents                                              |
//! |---------------|-------------------------------------------------------|
//! | [`frame`]     | Length-prefixed, HMAC-authenticated, CTR-encrypted frames |
//! | [`handshake`] | RSA bootstrap of the session secret and identifier    |
//! | [`queue`]     | Awaitable FIFO used for inbound message queues        |
//! | [`errors`]    | [`SessionError`] / [`HandshakeError`]                 |

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod handshake;
pub mod queue;

pub use errors::{HandshakeError, SessionError};
pub use queue::Queue;

use std::fmt;

/// Length of a session identifier in bytes.
pub const SESSION_ID_LEN: usize = 16;

/// A 128-bit session identifier.
///
/// Chosen by the connecting peer on first connect and replayed on every
/// reconnect; the accepting side uses it to route a fresh transport to the
/// surviving logical session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}
