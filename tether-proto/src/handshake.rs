//! Public-key bootstrap of a session.
//!
//! Bytes on the wire, in order:
//!
//! ```text
//! S→C: n[256] ‖ e[256]                          RSA public key, big-endian
//! C→S: rsa_oaep(pubkey, secret[32])[256]        session secret
//! C→S: hmac[32] ‖ aes_ctr(secret, 2⁶³)[16]      session identifier, fixed 48 bytes
//! ```
//!
//! The identifier frame carries no length prefix — its size is implicit —
//! and consumes the first client-direction nonce, so the regular framed
//! stream on each side starts from the correct counter.
//!
//! The server's key is sent in the clear with no signature or pinning: the
//! exchange is confidential against a passive attacker only.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tether_crypto::rsa::{PUBLIC_KEY_LEN, PrivateKey, PublicKey};
use tether_crypto::{EncryptionContext, MAC_LEN, Role, SECRET_LEN};

use crate::errors::HandshakeError;
use crate::{SESSION_ID_LEN, SessionId};

/// Wire size of the encrypted session-identifier frame.
const ID_FRAME_LEN: usize = MAC_LEN + SESSION_ID_LEN;

/// Accepting side of the handshake.
///
/// Returns the server-role [`EncryptionContext`] and the identifier the peer
/// presented. Any failure means no session comes into existence; the caller
/// drops the transport without a reply.
pub async fn server_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    key: &PrivateKey,
) -> Result<(EncryptionContext, SessionId), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&key.public().to_wire_bytes()).await?;
    writer.flush().await?;

    let mut encrypted_secret = [0u8; 256];
    reader.read_exact(&mut encrypted_secret).await?;
    let secret: [u8; SECRET_LEN] = key
        .decrypt_oaep(&encrypted_secret)?
        .try_into()
        .map_err(|_| HandshakeError::BadSecret)?;

    let mut crypto = EncryptionContext::new(Role::Server, secret);

    let mut id_frame = [0u8; ID_FRAME_LEN];
    reader.read_exact(&mut id_frame).await?;
    let id_bytes: [u8; SESSION_ID_LEN] = crypto
        .decrypt(&id_frame)
        .map_err(|_| HandshakeError::Tamper)?
        .try_into()
        .map_err(|_| HandshakeError::BadIdentifier)?;

    Ok((crypto, SessionId::from_bytes(id_bytes)))
}

/// Connecting side of the handshake.
///
/// Generates a fresh secret, encrypts it under the server's key and presents
/// `id` — newly generated on first connect, replayed on reconnect.
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    id: SessionId,
) -> Result<EncryptionContext, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut key_bytes = [0u8; PUBLIC_KEY_LEN];
    reader.read_exact(&mut key_bytes).await?;
    let key = PublicKey::from_wire_bytes(&key_bytes)?;

    let mut crypto = EncryptionContext::random(Role::Client);
    let encrypted_secret = key.encrypt_oaep(crypto.secret())?;
    writer.write_all(&encrypted_secret).await?;

    let id_frame = crypto.encrypt(id.as_bytes());
    debug_assert_eq!(id_frame.len(), ID_FRAME_LEN);
    writer.write_all(&id_frame).await?;
    writer.flush().await?;

    log::debug!("handshake complete for session {id}");
    Ok(crypto)
}
