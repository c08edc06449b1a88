//! RSA key handling for the session handshake.
//!
//! The accepting side presents a 2048-bit public key in a fixed wire form
//! (256-byte big-endian modulus followed by the 256-byte left-padded
//! exponent), and the connecting side answers with the session secret
//! encrypted under RSA-OAEP with SHA-1 and MGF1-SHA-1.
//!
//! The key is unauthenticated by design: the handshake defends against a
//! passive observer, not an active man-in-the-middle.

use std::fmt;

use num_bigint::BigUint;
use num_traits::One;
use sha1::{Digest, Sha1};

use crate::prime::generate_prime;

/// Public exponent used for generated keys.
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Modulus size of a handshake key in bits.
pub const KEY_BITS: u64 = 2048;

/// Modulus size of a handshake key in bytes; also the size of one OAEP block.
pub const MODULUS_LEN: usize = (KEY_BITS as usize) / 8;

/// Wire form of a public key: modulus ‖ exponent, each [`MODULUS_LEN`] bytes.
pub const PUBLIC_KEY_LEN: usize = MODULUS_LEN * 2;

const HASH_LEN: usize = 20; // SHA-1

const KEY_FILE_MAGIC: &[u8; 4] = b"TKY1";

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from RSA operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RsaError {
    /// The message does not fit in one OAEP block for this key.
    MessageTooLong {
        /// Message length in bytes.
        len: usize,
        /// Largest length the key can carry.
        max: usize,
    },
    /// The ciphertext has the wrong length or is not below the modulus.
    InvalidCiphertext,
    /// OAEP unpadding failed; wrong key or corrupted ciphertext.
    DecryptionFailed,
    /// A serialized key could not be parsed.
    MalformedKey,
}

impl fmt::Display for RsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLong { len, max } => {
                write!(f, "message of {len} bytes exceeds OAEP capacity of {max}")
            }
            Self::InvalidCiphertext => write!(f, "ciphertext out of range for key"),
            Self::DecryptionFailed => write!(f, "OAEP decryption failed"),
            Self::MalformedKey => write!(f, "malformed RSA key data"),
        }
    }
}

impl std::error::Error for RsaError {}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// An RSA public key `(n, e)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    e: BigUint,
}

/// An RSA private key; owns its public half.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    public: PublicKey,
    d: BigUint,
}

fn to_padded_be(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; len];
    out[len - raw.len()..].copy_from_slice(&raw);
    out
}

impl PublicKey {
    /// Modulus length in bytes, i.e. the OAEP block size.
    pub fn modulus_len(&self) -> usize {
        ((self.n.bits() as usize) + 7) / 8
    }

    /// Serialize to the handshake wire form: `n[256] ‖ e[256]`, big-endian.
    pub fn to_wire_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out[..MODULUS_LEN].copy_from_slice(&to_padded_be(&self.n, MODULUS_LEN));
        out[MODULUS_LEN..].copy_from_slice(&to_padded_be(&self.e, MODULUS_LEN));
        out
    }

    /// Parse the handshake wire form.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, RsaError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(RsaError::MalformedKey);
        }
        let n = BigUint::from_bytes_be(&bytes[..MODULUS_LEN]);
        let e = BigUint::from_bytes_be(&bytes[MODULUS_LEN..]);
        if n.bits() != KEY_BITS || e < BigUint::from(3u32) {
            return Err(RsaError::MalformedKey);
        }
        Ok(Self { n, e })
    }

    /// Encrypt `message` under RSA-OAEP (SHA-1, MGF1-SHA-1, empty label).
    ///
    /// Returns one ciphertext block of [`modulus_len`](Self::modulus_len)
    /// bytes.
    pub fn encrypt_oaep(&self, message: &[u8]) -> Result<Vec<u8>, RsaError> {
        let k = self.modulus_len();
        let max = k - 2 * HASH_LEN - 2;
        if message.len() > max {
            return Err(RsaError::MessageTooLong { len: message.len(), max });
        }

        // DB = lHash ‖ zero padding ‖ 0x01 ‖ message
        let mut db = vec![0u8; k - HASH_LEN - 1];
        db[..HASH_LEN].copy_from_slice(&sha1(&[]));
        let msg_start = db.len() - message.len();
        db[msg_start - 1] = 0x01;
        db[msg_start..].copy_from_slice(message);

        let mut seed = [0u8; HASH_LEN];
        getrandom::getrandom(&mut seed).expect("getrandom failed");

        xor_into(&mut db, &mgf1(&seed, k - HASH_LEN - 1));
        let mut masked_seed = seed.to_vec();
        xor_into(&mut masked_seed, &mgf1(&db, HASH_LEN));

        let mut em = Vec::with_capacity(k);
        em.push(0x00);
        em.extend_from_slice(&masked_seed);
        em.extend_from_slice(&db);

        let m = BigUint::from_bytes_be(&em);
        let c = m.modpow(&self.e, &self.n);
        Ok(to_padded_be(&c, k))
    }
}

impl PrivateKey {
    /// Generate a fresh key of `bits` modulus bits with e = 65537.
    ///
    /// Key strength is secondary here — the key only protects the exchange
    /// of a per-session secret — but generation still takes a noticeable
    /// moment; call once at startup.
    pub fn generate(bits: u64) -> Self {
        let e = BigUint::from(PUBLIC_EXPONENT);
        let one = BigUint::one();
        loop {
            let p = generate_prime(bits / 2);
            let q = generate_prime(bits / 2);
            if p == q {
                continue;
            }
            let phi = (&p - &one) * (&q - &one);
            // e is prime, so the inverse exists unless e divides p-1 or q-1.
            let Some(d) = e.modinv(&phi) else { continue };
            let n = &p * &q;
            return Self { public: PublicKey { n, e }, d };
        }
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Decrypt one OAEP ciphertext block produced by
    /// [`PublicKey::encrypt_oaep`].
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RsaError> {
        let k = self.public.modulus_len();
        if ciphertext.len() != k {
            return Err(RsaError::InvalidCiphertext);
        }
        let c = BigUint::from_bytes_be(ciphertext);
        if c >= self.public.n {
            return Err(RsaError::InvalidCiphertext);
        }

        let m = c.modpow(&self.d, &self.public.n);
        let em = to_padded_be(&m, k);

        if em[0] != 0x00 {
            return Err(RsaError::DecryptionFailed);
        }
        let (masked_seed, masked_db) = em[1..].split_at(HASH_LEN);

        let mut seed = masked_seed.to_vec();
        xor_into(&mut seed, &mgf1(masked_db, HASH_LEN));
        let mut db = masked_db.to_vec();
        xor_into(&mut db, &mgf1(&seed, k - HASH_LEN - 1));

        if db[..HASH_LEN] != sha1(&[]) {
            return Err(RsaError::DecryptionFailed);
        }
        // Skip the zero padding up to the 0x01 separator.
        let mut index = HASH_LEN;
        while index < db.len() && db[index] == 0x00 {
            index += 1;
        }
        if index == db.len() || db[index] != 0x01 {
            return Err(RsaError::DecryptionFailed);
        }
        Ok(db[index + 1..].to_vec())
    }

    /// Serialize for persistence (`rsa_key_path`).
    ///
    /// Format: magic `TKY1`, then `n`, `e`, `d` each as a `u16` big-endian
    /// length followed by big-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(KEY_FILE_MAGIC);
        for part in [&self.public.n, &self.public.e, &self.d] {
            let raw = part.to_bytes_be();
            out.extend_from_slice(&(raw.len() as u16).to_be_bytes());
            out.extend_from_slice(&raw);
        }
        out
    }

    /// Parse a key previously written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RsaError> {
        let rest = bytes
            .strip_prefix(KEY_FILE_MAGIC.as_slice())
            .ok_or(RsaError::MalformedKey)?;

        let mut pos = 0;
        let mut next = || -> Result<BigUint, RsaError> {
            let len_bytes: [u8; 2] = rest
                .get(pos..pos + 2)
                .ok_or(RsaError::MalformedKey)?
                .try_into()
                .map_err(|_| RsaError::MalformedKey)?;
            let len = u16::from_be_bytes(len_bytes) as usize;
            pos += 2;
            let raw = rest.get(pos..pos + len).ok_or(RsaError::MalformedKey)?;
            pos += len;
            Ok(BigUint::from_bytes_be(raw))
        };

        let n = next()?;
        let e = next()?;
        let d = next()?;
        if n.bits() == 0 || e < BigUint::from(3u32) || d.bits() == 0 {
            return Err(RsaError::MalformedKey);
        }
        Ok(Self { public: PublicKey { n, e }, d })
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({} bits)", self.public.n.bits())
    }
}

// ─── OAEP helpers ────────────────────────────────────────────────────────────

fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// MGF1 with SHA-1: concatenated `SHA1(seed ‖ counter)` blocks.
fn mgf1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + HASH_LEN);
    let mut counter = 0u32;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn xor_into(data: &mut [u8], mask: &[u8]) {
    for (byte, m) in data.iter_mut().zip(mask) {
        *byte ^= m;
    }
}
