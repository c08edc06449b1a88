//! Error types shared by both ends of a session.

use std::{fmt, io};

use tether_crypto::TamperError;
use tether_crypto::rsa::RsaError;
use tether_wire::{DecodeError, EncodeError};

// ─── SessionError ─────────────────────────────────────────────────────────────

/// The error type of post-handshake session operations (`send`, `receive`,
/// frame processing).
#[derive(Debug)]
pub enum SessionError {
    /// A value exceeded the frame or container limit. Local to the caller;
    /// the session stays usable.
    TooLarge,
    /// A frame failed to decode. Fatal: the session closes.
    Malformed(DecodeError),
    /// A frame failed authentication. Fatal: the session closes.
    Tamper,
    /// The session is closed; abandon the handle.
    Closed,
    /// Transport failure; the session enters its reconnect grace period.
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge => write!(f, "value exceeds the frame size limit"),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::Tamper => write!(f, "frame authentication failed"),
            Self::Closed => write!(f, "session is closed"),
            Self::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::TooLarge => Self::TooLarge,
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        Self::Malformed(e)
    }
}

impl From<TamperError> for SessionError {
    fn from(_: TamperError) -> Self {
        Self::Tamper
    }
}

// ─── HandshakeError ───────────────────────────────────────────────────────────

/// Any failure while establishing a session.
///
/// The accepting side reacts by silently closing the transport; no session
/// object is created.
#[derive(Debug)]
pub enum HandshakeError {
    /// Read/write failure on the raw transport.
    Io(io::Error),
    /// RSA failure: bad public key bytes or an undecryptable secret.
    Rsa(RsaError),
    /// The decrypted secret was not exactly 32 bytes.
    BadSecret,
    /// The identifier frame decrypted to the wrong length.
    BadIdentifier,
    /// The identifier frame failed authentication.
    Tamper,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "handshake I/O error: {e}"),
            Self::Rsa(e) => write!(f, "handshake RSA error: {e}"),
            Self::BadSecret => write!(f, "handshake produced a secret of the wrong size"),
            Self::BadIdentifier => write!(f, "session identifier has the wrong size"),
            Self::Tamper => write!(f, "session identifier failed authentication"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Rsa(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<RsaError> for HandshakeError {
    fn from(e: RsaError) -> Self {
        Self::Rsa(e)
    }
}
