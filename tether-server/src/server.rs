//! The server supervisor: accept loop, session registry, callbacks.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use tether_crypto::rsa::{KEY_BITS, PrivateKey, RsaError};
use tether_proto::handshake::server_handshake;
use tether_proto::SessionId;

use crate::message::Message;
use crate::session::{Session, SessionState};

// ─── Callbacks ───────────────────────────────────────────────────────────────

/// The error type application callbacks may return.
///
/// A returned error is reported to the log and otherwise ignored: a failing
/// handler never tears down the session that triggered it.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>>;

pub(crate) type SessionCallback = Arc<dyn Fn(Arc<Session>) -> CallbackFuture + Send + Sync>;
pub(crate) type MessageCallback = Arc<dyn Fn(Message) -> CallbackFuture + Send + Sync>;

/// Internal hook a session fires exactly once on close: registry removal
/// plus the user's disconnect callback.
pub(crate) type DisconnectHook =
    Arc<dyn Fn(Arc<Session>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Supervisor configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Grace period granted to resume a dropped session before it closes.
    pub reconnect_timeout: Duration,
    /// Path to a persisted RSA private key (the format written by
    /// [`PrivateKey::to_bytes`]). When absent a fresh 2048-bit key is
    /// generated on startup and never persisted.
    pub rsa_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { reconnect_timeout: Duration::from_secs(30), rsa_key_path: None }
    }
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from server construction and startup.
#[derive(Debug)]
pub enum ServerError {
    /// Reading the key file or binding the listener failed.
    Io(io::Error),
    /// The key file did not contain a usable key.
    Key(RsaError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Key(e) => write!(f, "RSA key file error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Key(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<RsaError> for ServerError {
    fn from(e: RsaError) -> Self {
        Self::Key(e)
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// The accepting side of the session layer.
///
/// Configure, register callbacks, then [`listen`](Self::listen):
///
/// ```rust,no_run
/// # use tether_server::{Server, ServerConfig};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = Server::new(ServerConfig::default())?;
/// server.on_new_connection(|session| async move {
///     session.send(&"welcome".into()).await?;
///     Ok(())
/// });
/// let handle = server.listen("0.0.0.0:65432").await?;
/// handle.join().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    rsa_key: PrivateKey,
    on_new_connection: Option<SessionCallback>,
    on_receiving_message: Option<MessageCallback>,
    on_client_disconnect: Option<SessionCallback>,
    on_reconnect: Option<SessionCallback>,
}

impl Server {
    /// Build a server, loading the RSA key from
    /// [`rsa_key_path`](ServerConfig::rsa_key_path) or generating one.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let rsa_key = match &config.rsa_key_path {
            Some(path) => PrivateKey::from_bytes(&std::fs::read(path)?)?,
            None => {
                tracing::info!("generating a fresh {KEY_BITS}-bit RSA key");
                PrivateKey::generate(KEY_BITS)
            }
        };
        Ok(Self::with_rsa_key(config, rsa_key))
    }

    /// Build a server around an existing key.
    pub fn with_rsa_key(config: ServerConfig, rsa_key: PrivateKey) -> Self {
        Self {
            config,
            rsa_key,
            on_new_connection: None,
            on_receiving_message: None,
            on_client_disconnect: None,
            on_reconnect: None,
        }
    }

    /// Called once per newly established session.
    pub fn on_new_connection<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.on_new_connection = Some(Arc::new(move |session| Box::pin(callback(session))));
        self
    }

    /// Called for every inbound message, in arrival order per session.
    ///
    /// When bound, each session runs a dispatch loop feeding this callback;
    /// [`Session::receive`] remains usable and competes for the same queue.
    pub fn on_receiving_message<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.on_receiving_message = Some(Arc::new(move |message| Box::pin(callback(message))));
        self
    }

    /// Called exactly once when a session reaches `CLOSED`.
    pub fn on_client_disconnect<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.on_client_disconnect = Some(Arc::new(move |session| Box::pin(callback(session))));
        self
    }

    /// Called when a dropped session resumes on a fresh transport.
    pub fn on_reconnect<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.on_reconnect = Some(Arc::new(move |session| Box::pin(callback(session))));
        self
    }

    /// Bind `addr` and start accepting connections in the background.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let core = Arc::new(ServerCore {
            reconnect_timeout: self.config.reconnect_timeout,
            rsa_key: self.rsa_key,
            registry: Mutex::new(HashMap::new()),
            on_new_connection: self.on_new_connection,
            on_receiving_message: self.on_receiving_message,
            on_client_disconnect: self.on_client_disconnect,
            on_reconnect: self.on_reconnect,
            tasks: TaskTracker::new(),
        });
        let accept = tokio::spawn(ServerCore::accept_loop(core.clone(), listener));
        Ok(ServerHandle { local_addr, accept, core })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    core: Arc<ServerCore>,
}

impl ServerHandle {
    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions currently in the registry.
    pub async fn session_count(&self) -> usize {
        self.core.registry.lock().await.len()
    }

    /// Run until the accept loop dies (i.e. forever, in practice).
    pub async fn join(self) {
        let _ = self.accept.await;
    }

    /// Stop accepting and close every live session.
    pub async fn shutdown(self) {
        self.accept.abort();
        let sessions: Vec<_> = self.core.registry.lock().await.values().cloned().collect();
        for session in sessions {
            session.shutdown().await;
        }
    }
}

// ─── Core ────────────────────────────────────────────────────────────────────

struct ServerCore {
    reconnect_timeout: Duration,
    rsa_key: PrivateKey,
    /// identifier → session; at most one session object per identifier.
    registry: Mutex<HashMap<SessionId, Arc<Session>>>,
    on_new_connection: Option<SessionCallback>,
    on_receiving_message: Option<MessageCallback>,
    on_client_disconnect: Option<SessionCallback>,
    on_reconnect: Option<SessionCallback>,
    tasks: TaskTracker,
}

impl ServerCore {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let core = self.clone();
                    self.tasks.spawn(async move { core.handle_connection(stream, peer).await });
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, mut writer) = stream.into_split();
        let (crypto, id) = match server_handshake(&mut reader, &mut writer, &self.rsa_key).await {
            Ok(done) => done,
            Err(error) => {
                // No session exists yet; drop the transport without a reply.
                tracing::debug!(%peer, %error, "handshake failed");
                return;
            }
        };

        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&id).cloned() {
            // Release the registry before touching the session: rebind drains
            // the outbound buffer over the fresh transport, and a slow peer
            // must not stall every other accept behind the server-wide lock.
            // Rebind re-checks the state under the session's own lock, so the
            // window this opens is handled there.
            drop(registry);
            match existing.state().await {
                SessionState::Reconnecting => {
                    if existing.rebind(reader, writer, crypto, peer).await.is_ok() {
                        tracing::info!(session = %id, %peer, "session resumed");
                        if let Some(callback) = &self.on_reconnect {
                            self.invoke(callback.clone(), existing, "reconnect");
                        }
                    } else {
                        tracing::warn!(session = %id, %peer, "reconnect raced a state change; rejecting transport");
                    }
                }
                state => {
                    tracing::warn!(session = %id, %peer, ?state, "duplicate identifier for a session that is not reconnecting; rejecting transport");
                }
            }
            return;
        }

        let session = Session::new(
            id,
            peer,
            writer,
            crypto,
            self.reconnect_timeout,
            Some(self.disconnect_hook()),
        );
        registry.insert(id, session.clone());
        session.start(reader, self.on_receiving_message.clone());
        drop(registry);

        tracing::info!(session = %id, %peer, "new session");
        if let Some(callback) = &self.on_new_connection {
            self.invoke(callback.clone(), session, "new connection");
        }
    }

    fn invoke(&self, callback: SessionCallback, session: Arc<Session>, what: &'static str) {
        self.tasks.spawn(async move {
            if let Err(error) = callback(session).await {
                tracing::error!(%error, "{what} callback failed");
            }
        });
    }

    /// Registry removal happens here, atomically with the user callback, and
    /// only while the identifier still maps to this exact session — a
    /// successor session under the same identifier must survive a late hook.
    fn disconnect_hook(self: &Arc<Self>) -> DisconnectHook {
        let core = self.clone();
        Arc::new(move |session: Arc<Session>| {
            let core = core.clone();
            Box::pin(async move {
                {
                    let mut registry = core.registry.lock().await;
                    if let Some(current) = registry.get(&session.id()) {
                        if Arc::ptr_eq(current, &session) {
                            registry.remove(&session.id());
                        }
                    }
                }
                if let Some(callback) = &core.on_client_disconnect {
                    if let Err(error) = callback(session).await {
                        tracing::error!(%error, "disconnect callback failed");
                    }
                }
            })
        })
    }
}
