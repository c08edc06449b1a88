//! # tether-client
//!
//! The connecting side of the tether session layer.
//!
//! A [`Connection`] dials a server, bootstraps the encrypted session and
//! then exchanges typed values. The 128-bit session identifier is generated
//! here on first connect and replayed by [`Connection::reconnect`], which
//! lets the server resume the logical session — including anything it
//! buffered while the transport was gone.
//!
//! ```rust,no_run
//! use tether_client::Connection;
//! use tether_wire::Value;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::connect("127.0.0.1:65432").await?;
//! connection.send(&Value::from("hello")).await?;
//! let reply = connection.receive().await?;
//! println!("{:?} (sent {})", reply.contents, reply.sent_at);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, Notify};
use tokio_util::task::TaskTracker;

use tether_crypto::EncryptionContext;
use tether_proto::handshake::client_handshake;
use tether_proto::{HandshakeError, Queue, SessionError, SessionId, frame};
use tether_wire::Value;

// ─── Message ─────────────────────────────────────────────────────────────────

/// A decoded inbound message. The peer is the server, so unlike the
/// accepting side there is no author field.
#[derive(Clone, Debug)]
pub struct Message {
    /// The decoded value.
    pub contents: Value,
    /// Server-reported send time, taken from the frame.
    pub sent_at: DateTime<Utc>,
    /// Local time the frame arrived.
    pub received_at: DateTime<Utc>,
}

fn datetime_from_unix(seconds: f64) -> DateTime<Utc> {
    Utc.timestamp_nanos((seconds * 1e9) as i64)
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from [`Connection::connect`] and [`Connection::reconnect`].
#[derive(Debug)]
pub enum ConnectError {
    /// Dialing or socket setup failed.
    Io(std::io::Error),
    /// The handshake failed; the transport was dropped.
    Handshake(HandshakeError),
    /// [`reconnect`](Connection::reconnect) was called while the link is up.
    AlreadyConnected,
    /// The connection was closed locally and cannot be revived.
    Closed,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "connect failed: {e}"),
            Self::Handshake(e) => write!(f, "{e}"),
            Self::AlreadyConnected => write!(f, "connection is already established"),
            Self::Closed => write!(f, "connection was closed"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HandshakeError> for ConnectError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e)
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

struct ClientInner {
    writer: OwnedWriteHalf,
    crypto: EncryptionContext,
    /// Bumped on every reconnect; fences readers of superseded transports.
    epoch: u64,
}

struct Shared {
    id: SessionId,
    server_addr: SocketAddr,
    inner: Mutex<ClientInner>,
    inbound: Queue<Message>,
    /// Wakes `receive` when the link status changes.
    status: Notify,
    down: AtomicBool,
    closed: AtomicBool,
    tasks: TaskTracker,
}

impl Shared {
    /// Flag the link as lost, unless `epoch` belongs to an old transport.
    async fn mark_down(&self, epoch: u64) {
        let inner = self.inner.lock().await;
        if inner.epoch == epoch {
            self.down.store(true, Ordering::SeqCst);
            drop(inner);
            self.status.notify_waiters();
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, epoch: u64) {
        loop {
            match frame::read_raw_frame(&mut reader).await {
                Ok(body) => {
                    let received_at = Utc::now();
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        // A reconnect replaced this transport mid-read.
                        return;
                    }
                    match frame::open_frame(&mut inner.crypto, &body) {
                        Ok((value, sent_at)) => {
                            drop(inner);
                            let message = Message {
                                contents: value,
                                sent_at: datetime_from_unix(sent_at),
                                received_at,
                            };
                            if !self.inbound.push(message) {
                                return;
                            }
                        }
                        Err(error) => {
                            drop(inner);
                            tracing::warn!(%error, "fatal frame error; dropping transport");
                            self.mark_down(epoch).await;
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "server transport lost");
                    self.mark_down(epoch).await;
                    return;
                }
            }
        }
    }
}

/// A client session handle. Cheap to clone; all clones share the link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Dial `addr` and establish a fresh session.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ConnectError> {
        let stream = TcpStream::connect(addr).await?;
        let server_addr = stream.peer_addr()?;
        let id = SessionId::generate();

        let (mut reader, mut writer) = stream.into_split();
        let crypto = client_handshake(&mut reader, &mut writer, id).await?;

        let shared = Arc::new(Shared {
            id,
            server_addr,
            inner: Mutex::new(ClientInner { writer, crypto, epoch: 0 }),
            inbound: Queue::new(),
            status: Notify::new(),
            down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        });
        shared.tasks.spawn(shared.clone().read_loop(reader, 0));

        tracing::info!(session = %id, %server_addr, "connected");
        Ok(Self { shared })
    }

    /// Re-dial the server and resume the session under the same identifier.
    ///
    /// Only valid once the link has been lost; the server replays anything
    /// it buffered during the gap, in order, before new traffic.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        let mut inner = self.shared.inner.lock().await;
        if !self.shared.down.load(Ordering::SeqCst) {
            return Err(ConnectError::AlreadyConnected);
        }

        let stream = TcpStream::connect(self.shared.server_addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        let crypto = client_handshake(&mut reader, &mut writer, self.shared.id).await?;

        inner.writer = writer;
        inner.crypto = crypto;
        inner.epoch += 1;
        let epoch = inner.epoch;
        self.shared.down.store(false, Ordering::SeqCst);
        drop(inner);

        self.shared.tasks.spawn(self.shared.clone().read_loop(reader, epoch));
        self.shared.status.notify_waiters();
        tracing::info!(session = %self.shared.id, "reconnected");
        Ok(())
    }

    /// Send one value to the server.
    ///
    /// Fails with [`SessionError::TooLarge`] for oversized values and
    /// [`SessionError::Closed`] while the link is down or closed.
    pub async fn send(&self, value: &Value) -> Result<(), SessionError> {
        let payload = frame::encode_payload(value)?;
        let mut inner = self.shared.inner.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.down.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let ClientInner { writer, crypto, .. } = &mut *inner;
        match frame::write_payload(writer, crypto, &payload).await {
            Ok(()) => Ok(()),
            Err(SessionError::Io(error)) => {
                let epoch = inner.epoch;
                drop(inner);
                self.shared.mark_down(epoch).await;
                Err(SessionError::Io(error))
            }
            Err(other) => Err(other),
        }
    }

    /// Wait for the next message from the server.
    ///
    /// Buffered messages are drained even after the link goes down; with
    /// nothing buffered and no live link this fails with
    /// [`SessionError::Closed`] (reconnect and retry, if desired).
    pub async fn receive(&self) -> Result<Message, SessionError> {
        loop {
            // Register for status changes before checking, so a link drop
            // between the check and the wait is not missed.
            let status = self.shared.status.notified();
            tokio::pin!(status);
            status.as_mut().enable();
            if let Some(message) = self.shared.inbound.try_pop() {
                return Ok(message);
            }
            if self.shared.closed.load(Ordering::SeqCst)
                || self.shared.down.load(Ordering::SeqCst)
            {
                return Err(SessionError::Closed);
            }
            tokio::select! {
                message = self.shared.inbound.pop() => {
                    return message.ok_or(SessionError::Closed);
                }
                _ = status.as_mut() => {}
            }
        }
    }

    /// Close the connection for good. Idempotent; a later
    /// [`reconnect`](Self::reconnect) is refused.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.inner.lock().await;
        let _ = inner.writer.shutdown().await;
        drop(inner);
        self.shared.inbound.close();
        self.shared.status.notify_waiters();
        tracing::debug!(session = %self.shared.id, "connection closed");
    }

    /// The session identifier presented to the server.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The server address used for connecting and reconnecting.
    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server_addr
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        !self.shared.down.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.shared.id)
    }
}
