//! Cryptographic primitives for tether sessions.
//!
//! Provides:
//! - [`EncryptionContext`] — the per-session symmetric state: a shared
//!   32-byte secret and one monotonic nonce counter per direction
//! - AES-256-CTR encryption with HMAC-SHA-256 authentication by composition
//! - RSA key generation and OAEP padding for the handshake ([`rsa`])
//!
//! The two directions of a session split the 64-bit nonce space in half:
//! server-originated frames count up from `0`, client-originated frames from
//! `2⁶³`. Nonce reuse is therefore structurally impossible for the first
//! `2⁶³` frames per direction.

#![deny(unsafe_code)]

mod prime;
pub mod rsa;

use std::fmt;

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Length of the shared symmetric secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Length of the authentication tag prepended to every ciphertext.
pub const MAC_LEN: usize = 32;

/// First nonce of the client-originated direction.
const CLIENT_NONCE_BASE: u64 = 1 << 63;

// ─── Tamper ──────────────────────────────────────────────────────────────────

/// HMAC verification failed: the frame was corrupted or forged.
///
/// Fatal to the session that received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TamperError;

impl fmt::Display for TamperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame authentication failed")
    }
}

impl std::error::Error for TamperError {}

// ─── EncryptionContext ───────────────────────────────────────────────────────

/// Which end of the session this context encrypts for.
///
/// The role decides which half of the nonce space outgoing frames draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The accepting end; encrypts with nonces `0, 1, 2, …`
    Server,
    /// The connecting end; encrypts with nonces `2⁶³, 2⁶³+1, …`
    Client,
}

/// Per-session symmetric encryption state.
///
/// Each call to [`encrypt`](Self::encrypt) consumes the next outgoing nonce,
/// each successful [`decrypt`](Self::decrypt) the next incoming one. Frames
/// must therefore be processed in the exact order they were produced.
pub struct EncryptionContext {
    secret: [u8; SECRET_LEN],
    encrypt_counter: u64,
    decrypt_counter: u64,
}

impl EncryptionContext {
    /// Build a context for `role` over an agreed secret.
    pub fn new(role: Role, secret: [u8; SECRET_LEN]) -> Self {
        let (encrypt_counter, decrypt_counter) = match role {
            Role::Server => (0, CLIENT_NONCE_BASE),
            Role::Client => (CLIENT_NONCE_BASE, 0),
        };
        Self { secret, encrypt_counter, decrypt_counter }
    }

    /// Build a context for `role` with a freshly generated secret.
    pub fn random(role: Role) -> Self {
        let mut secret = [0u8; SECRET_LEN];
        getrandom::getrandom(&mut secret).expect("getrandom failed");
        Self::new(role, secret)
    }

    /// The shared secret, e.g. for transmission under the peer's RSA key.
    pub fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }

    fn apply_keystream(&self, nonce: u64, data: &mut [u8]) {
        // Counter block: 8-byte big-endian nonce followed by a zero 64-bit
        // block counter, incremented big-endian over the whole block.
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&nonce.to_be_bytes());
        let mut cipher = Aes256Ctr::new(&self.secret.into(), &iv.into());
        cipher.apply_keystream(data);
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    /// Encrypt `plaintext`, consuming the next outgoing nonce.
    ///
    /// Returns `HMAC-SHA-256(secret, ciphertext) ‖ ciphertext`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = self.encrypt_counter;
        self.encrypt_counter += 1;

        let mut ciphertext = plaintext.to_vec();
        self.apply_keystream(nonce, &mut ciphertext);

        let mut mac = self.mac();
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(MAC_LEN + ciphertext.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Verify and decrypt a `HMAC ‖ ciphertext` frame.
    ///
    /// The tag is checked in constant time before the incoming nonce is
    /// consumed; a rejected frame leaves the counter untouched.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, TamperError> {
        if frame.len() < MAC_LEN {
            return Err(TamperError);
        }
        let (tag, ciphertext) = frame.split_at(MAC_LEN);

        let mut mac = self.mac();
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| TamperError)?;

        let nonce = self.decrypt_counter;
        self.decrypt_counter += 1;

        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(nonce, &mut plaintext);
        Ok(plaintext)
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret.
        f.debug_struct("EncryptionContext")
            .field("encrypt_counter", &self.encrypt_counter)
            .field("decrypt_counter", &self.decrypt_counter)
            .finish_non_exhaustive()
    }
}
