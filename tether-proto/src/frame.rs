//! The post-handshake frame codec.
//!
//! One frame on the wire, per direction:
//!
//! ```text
//! [ 2 bytes  big-endian length L of (HMAC ‖ ciphertext) ]
//! [ 32 bytes HMAC-SHA-256 of ciphertext under the session secret ]
//! [ L-32 bytes AES-256-CTR ciphertext ]
//! ```
//!
//! with the plaintext being an 8-byte big-endian IEEE-754 send timestamp
//! (Unix seconds) followed by one encoded [`Value`]. The CTR nonce is the
//! sender's next direction counter ([`tether_crypto::EncryptionContext`]);
//! frames are processed in strict order within a direction.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tether_crypto::{EncryptionContext, MAC_LEN};
use tether_wire::Value;

use crate::errors::SessionError;

/// Hard protocol limit for one frame, length prefix excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024 - 1;

/// Size of the timestamp header inside the plaintext.
const TIMESTAMP_LEN: usize = 8;

/// Largest encoded value that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - MAC_LEN - TIMESTAMP_LEN;

/// Encode `value` and check it against the frame budget.
///
/// Oversized values fail with [`SessionError::TooLarge`] — large payloads
/// must be chunked by the application.
pub fn encode_payload(value: &Value) -> Result<Vec<u8>, SessionError> {
    let payload = value.to_bytes()?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SessionError::TooLarge);
    }
    Ok(payload)
}

/// Current Unix time as the wire's IEEE-754 seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock predates the Unix epoch")
        .as_secs_f64()
}

/// Stamp, encrypt and write one pre-encoded payload, flushing the writer.
///
/// Returns once the transport has accepted the whole frame. The payload must
/// come from [`encode_payload`]; the send timestamp is taken here, at actual
/// transmission time.
pub async fn write_payload<W>(
    writer: &mut W,
    crypto: &mut EncryptionContext,
    payload: &[u8],
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let mut plaintext = Vec::with_capacity(TIMESTAMP_LEN + payload.len());
    plaintext.extend_from_slice(&unix_now().to_be_bytes());
    plaintext.extend_from_slice(payload);

    let body = crypto.encrypt(&plaintext);
    debug_assert!(body.len() <= MAX_FRAME_LEN);

    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode, stamp, encrypt and write one value.
pub async fn write_frame<W>(
    writer: &mut W,
    crypto: &mut EncryptionContext,
    value: &Value,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_payload(value)?;
    write_payload(writer, crypto, &payload).await
}

/// Read the raw body (`HMAC ‖ ciphertext`) of the next frame.
///
/// Split out from [`read_frame`] so a reader task can block here without
/// holding any session state.
pub async fn read_raw_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Authenticate, decrypt and decode a raw frame body.
///
/// Returns the decoded value and the sender's timestamp. Errors are fatal to
/// the session ([`SessionError::Tamper`] / [`SessionError::Malformed`]).
pub fn open_frame(
    crypto: &mut EncryptionContext,
    body: &[u8],
) -> Result<(Value, f64), SessionError> {
    let plaintext = crypto.decrypt(body)?;
    if plaintext.len() < TIMESTAMP_LEN {
        return Err(SessionError::Malformed(
            tether_wire::DecodeError::UnexpectedEof,
        ));
    }
    let sent_at = f64::from_be_bytes(
        plaintext[..TIMESTAMP_LEN]
            .try_into()
            .expect("slice has timestamp length"),
    );
    let value = Value::from_bytes(&plaintext[TIMESTAMP_LEN..])?;
    Ok((value, sent_at))
}

/// Read, authenticate, decrypt and decode the next frame.
pub async fn read_frame<R>(
    reader: &mut R,
    crypto: &mut EncryptionContext,
) -> Result<(Value, f64), SessionError>
where
    R: AsyncRead + Unpin,
{
    let body = read_raw_frame(reader).await?;
    open_frame(crypto, &body)
}
