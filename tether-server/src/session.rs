//! The per-client session state machine.
//!
//! A session is the logical connection: it owns the encryption state, the
//! inbound message queue and — while one exists — the live transport pair.
//! The transport may die and be replaced without the session noticing more
//! than a pause:
//!
//! ```text
//!            transport EOF / write error
//!   OPEN ──────────────────────────────────▶ RECONNECTING
//!    ▲                                            │
//!    │ supervisor binds a fresh transport         │ grace period expires,
//!    └────────────────────────────────────────────┤ or shutdown()
//!                                                 ▼
//!                                              CLOSED (terminal)
//! ```
//!
//! Values sent while reconnecting queue up and drain FIFO on resume, before
//! anything submitted afterwards. The state is monotonic with respect to
//! `CLOSED`: once closed, a session never comes back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio_util::task::TaskTracker;

use tether_crypto::EncryptionContext;
use tether_proto::{Queue, SessionError, SessionId, frame};
use tether_wire::Value;

use crate::message::{Message, datetime_from_unix};
use crate::server::{DisconnectHook, MessageCallback};

/// Observable session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// A live transport is bound; traffic flows.
    Open,
    /// The transport is gone; the session waits for the client to return.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Transport state, tagged so the writer and cipher only exist while open.
enum Link {
    Open(OpenLink),
    Reconnecting,
    Closed,
}

struct OpenLink {
    writer: OwnedWriteHalf,
    crypto: EncryptionContext,
}

struct Inner {
    link: Link,
    /// Values submitted while reconnecting, already encoded, FIFO.
    pending: Vec<Vec<u8>>,
    /// Fresh read half deposited by the supervisor on rebind, picked up by
    /// the reader task.
    handoff: Option<OwnedReadHalf>,
    peer_addr: SocketAddr,
    /// Bumped on every state transition; fences stale grace-period timers.
    epoch: u64,
}

impl Inner {
    fn mark_reconnecting(&mut self) -> u64 {
        self.link = Link::Reconnecting;
        self.epoch += 1;
        self.epoch
    }
}

/// A logical client connection that survives transport reconnection.
///
/// Handles are shared as `Arc<Session>`; the supervisor, the reader task,
/// groups and application callbacks all hold the same object.
pub struct Session {
    id: SessionId,
    reconnect_timeout: Duration,
    inner: Mutex<Inner>,
    inbound: Queue<Message>,
    /// Wakes the reader (and anyone parked on a state change) after a
    /// rebind, a transport loss or shutdown.
    resume: Notify,
    tasks: TaskTracker,
    disconnect_hook: Option<DisconnectHook>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
        crypto: EncryptionContext,
        reconnect_timeout: Duration,
        disconnect_hook: Option<DisconnectHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            reconnect_timeout,
            inner: Mutex::new(Inner {
                link: Link::Open(OpenLink { writer, crypto }),
                pending: Vec::new(),
                handoff: None,
                peer_addr,
                epoch: 0,
            }),
            inbound: Queue::new(),
            resume: Notify::new(),
            tasks: TaskTracker::new(),
            disconnect_hook,
        })
    }

    /// Spawn the reader and, when a message callback is bound, the dispatch
    /// loop that feeds it.
    pub(crate) fn start(self: &Arc<Self>, reader: OwnedReadHalf, on_message: Option<MessageCallback>) {
        self.tasks.spawn(self.clone().read_loop(reader));

        if let Some(callback) = on_message {
            let session = self.clone();
            self.tasks.spawn(async move {
                while let Some(message) = session.inbound.pop().await {
                    // Each invocation runs as its own task so a slow handler
                    // never stalls the read path; failures are reported, not
                    // propagated.
                    let callback = callback.clone();
                    session.tasks.spawn(async move {
                        if let Err(error) = callback(message).await {
                            tracing::error!(%error, "message callback failed");
                        }
                    });
                }
            });
        }
    }

    /// The 128-bit identifier chosen by the client.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Address of the peer's current (or last) transport. Informational.
    pub async fn peer_addr(&self) -> SocketAddr {
        self.inner.lock().await.peer_addr
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        match self.inner.lock().await.link {
            Link::Open(_) => SessionState::Open,
            Link::Reconnecting => SessionState::Reconnecting,
            Link::Closed => SessionState::Closed,
        }
    }

    /// Send one value to the client.
    ///
    /// While the session is open this returns once the transport has
    /// accepted the frame. While it reconnects, the value is buffered and
    /// delivered (in submission order) on resume. On a closed session it
    /// fails with [`SessionError::Closed`]; oversized values fail with
    /// [`SessionError::TooLarge`] regardless of state.
    pub async fn send(self: &Arc<Self>, value: &Value) -> Result<(), SessionError> {
        let payload = frame::encode_payload(value)?;
        let mut inner = self.inner.lock().await;
        match &mut inner.link {
            Link::Closed => Err(SessionError::Closed),
            Link::Reconnecting => {
                inner.pending.push(payload);
                Ok(())
            }
            Link::Open(open) => {
                match frame::write_payload(&mut open.writer, &mut open.crypto, &payload).await {
                    Ok(()) => Ok(()),
                    Err(SessionError::Io(error)) => {
                        // A failed write means the transport is gone: hold
                        // the value with the session and wait for the client.
                        tracing::debug!(session = %self.id, %error, "write failed; buffering for reconnect");
                        let epoch = inner.mark_reconnecting();
                        inner.pending.push(payload);
                        drop(inner);
                        self.arm_reconnect_deadline(epoch);
                        self.resume.notify_waiters();
                        Ok(())
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    /// Wait for the next inbound message.
    ///
    /// Messages buffered before a close are still delivered; afterwards the
    /// call fails with [`SessionError::Closed`].
    pub async fn receive(&self) -> Result<Message, SessionError> {
        self.inbound.pop().await.ok_or(SessionError::Closed)
    }

    /// Force the session to `CLOSED`. Idempotent.
    ///
    /// Closes the transport, discards any values still buffered for a
    /// reconnect, unblocks every waiter and schedules the disconnect hook
    /// exactly once.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.link, Link::Closed) {
                return;
            }
            let previous = std::mem::replace(&mut inner.link, Link::Closed);
            inner.epoch += 1;
            inner.pending.clear();
            inner.handoff = None;
            if let Link::Open(mut open) = previous {
                let _ = open.writer.shutdown().await;
            }
        }
        self.inbound.close();
        self.resume.notify_waiters();
        tracing::debug!(session = %self.id, "session closed");

        if let Some(hook) = &self.disconnect_hook {
            let hook = hook.clone();
            let session = self.clone();
            self.tasks.spawn(async move { hook(session).await });
        }
    }

    /// Bind a fresh transport and cipher to a reconnecting session.
    ///
    /// Fails if the session is not in the reconnect window (the supervisor
    /// rejects the transport in that case). Buffered values drain FIFO while
    /// the session lock is held, so nothing submitted afterwards can jump
    /// the queue.
    pub(crate) async fn rebind(
        self: &Arc<Self>,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        crypto: EncryptionContext,
        peer_addr: SocketAddr,
    ) -> Result<(), NotReconnecting> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.link, Link::Reconnecting) {
            return Err(NotReconnecting);
        }
        inner.link = Link::Open(OpenLink { writer, crypto });
        inner.epoch += 1;
        inner.peer_addr = peer_addr;
        inner.handoff = Some(reader);

        let queued = std::mem::take(&mut inner.pending);
        if !queued.is_empty() {
            tracing::debug!(session = %self.id, count = queued.len(), "draining buffered values");
        }
        let mut failed_at = None;
        if let Link::Open(open) = &mut inner.link {
            for (index, payload) in queued.iter().enumerate() {
                if let Err(error) =
                    frame::write_payload(&mut open.writer, &mut open.crypto, payload).await
                {
                    tracing::debug!(session = %self.id, %error, "transport lost while draining");
                    failed_at = Some(index);
                    break;
                }
            }
        }
        if let Some(index) = failed_at {
            // The fresh transport died mid-drain. Keep the unsent tail (the
            // partially written frame is resent whole under the next cipher)
            // and fall back to waiting for the client again.
            inner.pending = queued[index..].to_vec();
            inner.handoff = None;
            let epoch = inner.mark_reconnecting();
            drop(inner);
            self.arm_reconnect_deadline(epoch);
            return Ok(());
        }
        drop(inner);
        self.resume.notify_waiters();
        Ok(())
    }

    /// Bound the reconnect grace period entered at `epoch`.
    ///
    /// The timer does not need cancelling: after the sleep it re-checks that
    /// this exact grace period is still current, so a session that resumed
    /// (and possibly dropped again) meanwhile is left alone.
    fn arm_reconnect_deadline(self: &Arc<Self>, epoch: u64) {
        let session = self.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(session.reconnect_timeout).await;
            let expired = {
                let inner = session.inner.lock().await;
                matches!(inner.link, Link::Reconnecting) && inner.epoch == epoch
            };
            if expired {
                tracing::info!(session = %session.id, "reconnect window expired");
                session.shutdown().await;
            }
        });
    }

    async fn transport_lost(self: &Arc<Self>, error: &std::io::Error) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.link, Link::Open(_)) {
            return;
        }
        tracing::debug!(session = %self.id, %error, "transport lost; holding session for reconnect");
        let epoch = inner.mark_reconnecting();
        drop(inner);
        self.arm_reconnect_deadline(epoch);
    }

    /// Decrypt, decode and enqueue one raw frame body.
    ///
    /// Returns `false` when the reader should stop. Frame-level failures are
    /// fatal to the whole session per protocol policy.
    async fn handle_frame(self: &Arc<Self>, body: Vec<u8>) -> bool {
        let received_at = Utc::now();
        let mut inner = self.inner.lock().await;
        let open = match &mut inner.link {
            Link::Open(open) => open,
            Link::Closed => return false,
            // Raced with a send-side transition; the bytes belong to the
            // dead transport's cipher, which no longer exists.
            Link::Reconnecting => return true,
        };
        match frame::open_frame(&mut open.crypto, &body) {
            Ok((value, sent_at)) => {
                drop(inner);
                let message = Message {
                    contents: value,
                    author: self.clone(),
                    sent_at: datetime_from_unix(sent_at),
                    received_at,
                };
                self.inbound.push(message)
            }
            Err(error) => {
                drop(inner);
                tracing::warn!(session = %self.id, %error, "fatal frame error; closing session");
                self.shutdown().await;
                false
            }
        }
    }

    /// The reader task: one per session, across every transport it wears.
    async fn read_loop(self: Arc<Self>, first: OwnedReadHalf) {
        let mut reader = Some(first);
        loop {
            match reader.as_mut() {
                Some(transport) => {
                    let resumed = self.resume.notified();
                    tokio::pin!(resumed);
                    resumed.as_mut().enable();
                    // Biased: a state transition must preempt whatever the
                    // old socket still delivers, or a frame read off a dead
                    // transport could race the cipher that replaced it.
                    tokio::select! {
                        biased;
                        _ = resumed.as_mut() => {
                            let mut inner = self.inner.lock().await;
                            match inner.link {
                                Link::Closed => break,
                                Link::Reconnecting => {
                                    drop(inner);
                                    reader = None;
                                }
                                Link::Open(_) => {
                                    // A rebind can land while this task is
                                    // still blocked on the old socket; switch
                                    // to the transport it deposited.
                                    if let Some(next) = inner.handoff.take() {
                                        reader = Some(next);
                                    }
                                }
                            }
                        }
                        result = frame::read_raw_frame(transport) => match result {
                            Ok(body) => {
                                if !self.handle_frame(body).await {
                                    break;
                                }
                            }
                            Err(error) => {
                                reader = None;
                                self.transport_lost(&error).await;
                                if matches!(self.inner.lock().await.link, Link::Closed) {
                                    break;
                                }
                            }
                        },
                    }
                }
                None => {
                    // Parked until the supervisor hands over a new transport
                    // or the session closes. Register interest first so a
                    // wake between the check and the await is not lost.
                    let resumed = self.resume.notified();
                    tokio::pin!(resumed);
                    resumed.as_mut().enable();
                    {
                        let mut inner = self.inner.lock().await;
                        if matches!(inner.link, Link::Closed) {
                            break;
                        }
                        if let Some(next) = inner.handoff.take() {
                            reader = Some(next);
                            continue;
                        }
                    }
                    resumed.await;
                }
            }
        }
        tracing::trace!(session = %self.id, "reader finished");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.id)
    }
}

/// Rebind was refused because the session is not in its reconnect window.
#[derive(Debug)]
pub(crate) struct NotReconnecting;
