//! # tether-server
//!
//! The accepting side of the tether session layer.
//!
//! A [`Server`] listens for TCP connections, runs the encrypted handshake on
//! each, and hands the application long-lived [`Session`]s that survive
//! transport loss: when a client's connection drops, its session lingers in
//! a reconnect grace period, buffering outbound values, and resumes
//! transparently when the client returns with the same identifier.
//!
//! ## Features
//! - Typed, length-delimited messages with authenticated encryption
//! - Per-session reconnect state machine with a bounded grace period
//! - FIFO outbound buffering across reconnects
//! - [`Group`] broadcast over arbitrary session/group graphs, cycle-safe
//!   and duplicate-free
//! - Async application callbacks for connect, message, disconnect and
//!   reconnect, isolated from session lifecycles
//!
//! ```rust,no_run
//! use tether_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default())?;
//!     server.on_receiving_message(|message| async move {
//!         message.author.send(&message.contents).await?; // echo
//!         Ok(())
//!     });
//!     server.listen("0.0.0.0:65432").await?.join().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod group;
pub mod message;
pub mod server;
pub mod session;

pub use group::{Group, GroupMember};
pub use message::Message;
pub use server::{CallbackError, Server, ServerConfig, ServerError, ServerHandle};
pub use session::{Session, SessionState};

pub use tether_proto::{SessionError, SessionId};
pub use tether_wire::Value;
