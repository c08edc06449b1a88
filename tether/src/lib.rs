//! # tether — a reconnecting encrypted session layer for TCP
//!
//! `tether` is a modular library for message-oriented client/server
//! networking. It consists of five focused sub-crates wired together here
//! for convenience:
//!
//! | Sub-crate       | Role                                               |
//! |-----------------|----------------------------------------------------|
//! | `tether-wire`   | Self-describing encoding of the value kinds        |
//! | `tether-crypto` | AES-256-CTR framing keys, HMAC, RSA-OAEP bootstrap |
//! | `tether-proto`  | Frame codec, handshake, session identifiers        |
//! | `tether-server` | Sessions, supervisor, reconnect logic, groups      |
//! | `tether-client` | Connecting peer with identifier-preserving reconnect |
//!
//! ## Quick start: echo server
//!
//! ```rust,no_run
//! use tether::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default())?;
//!     server.on_receiving_message(|message| async move {
//!         message.author.send(&message.contents).await?;
//!         Ok(())
//!     });
//!     server.listen("0.0.0.0:65432").await?.join().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Quick start: client
//!
//! ```rust,no_run
//! use tether::{Connection, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::connect("127.0.0.1:65432").await?;
//! connection.send(&Value::from("ping")).await?;
//! let reply = connection.receive().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`tether_wire`] — the value kinds and their codec.
pub use tether_wire as wire;

/// Re-export of [`tether_crypto`] — encryption context and RSA primitives.
pub use tether_crypto as crypto;

/// Re-export of [`tether_proto`] — frames, handshake, identifiers, errors.
pub use tether_proto as proto;

/// Re-export of [`tether_server`] — sessions, supervisor and groups.
pub use tether_server as server;

/// Re-export of [`tether_client`] — the connecting peer.
pub use tether_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use tether_client::Connection;
pub use tether_proto::{HandshakeError, SessionError, SessionId};
pub use tether_server::{Group, Message, Server, ServerConfig, Session, SessionState};
pub use tether_wire::Value;
