//! End-to-end tests over real loopback TCP.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use tether_client::Connection;
use tether_crypto::EncryptionContext;
use tether_crypto::rsa::{KEY_BITS, PrivateKey};
use tether_proto::handshake::client_handshake;
use tether_proto::{SessionError, SessionId, frame};
use tether_server::{Server, ServerConfig, Session, SessionState, Value};

fn key() -> PrivateKey {
    static KEY: OnceLock<PrivateKey> = OnceLock::new();
    KEY.get_or_init(|| PrivateKey::generate(KEY_BITS)).clone()
}

fn config(reconnect_timeout: Duration) -> ServerConfig {
    ServerConfig { reconnect_timeout, rsa_key_path: None }
}

/// A protocol-level client that can sever and re-establish its transport at
/// will, which the high-level `Connection` deliberately cannot.
struct RawClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    crypto: EncryptionContext,
}

impl RawClient {
    async fn connect(addr: std::net::SocketAddr, id: SessionId) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let crypto = client_handshake(&mut reader, &mut writer, id).await.unwrap();
        Self { reader, writer, crypto }
    }

    async fn send(&mut self, value: &Value) {
        frame::write_frame(&mut self.writer, &mut self.crypto, value).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        frame::read_frame(&mut self.reader, &mut self.crypto).await.unwrap().0
    }
}

async fn wait_for_state(session: &Arc<Session>, wanted: SessionState) {
    timeout(Duration::from_secs(5), async {
        while session.state().await != wanted {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {wanted:?}"));
}

#[tokio::test]
async fn echo_roundtrip() {
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_receiving_message(|message| async move {
        message.author.send(&message.contents).await?;
        Ok(())
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let connection = Connection::connect(handle.local_addr()).await.unwrap();
    let value = Value::List(vec![
        Value::from(1i64),
        Value::from("ab"),
        Value::Bool(true),
        Value::Null,
    ]);
    connection.send(&value).await.unwrap();
    let reply = timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(reply.contents, value);

    handle.shutdown().await;
}

#[tokio::test]
async fn explicit_receive_without_callback() {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let connection = Connection::connect(handle.local_addr()).await.unwrap();
    let session = session_rx.recv().await.unwrap();

    connection.send(&Value::from("ping")).await.unwrap();
    let message = timeout(Duration::from_secs(5), session.receive()).await.unwrap().unwrap();
    assert_eq!(message.contents, Value::from("ping"));
    assert_eq!(message.author.id(), connection.id());
    assert!(message.received_at >= message.sent_at - chrono::Duration::seconds(5));

    session.send(&Value::from("pong")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(reply.contents, Value::from("pong"));

    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_preserves_order() {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let (resume_tx, mut resume_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    server.on_reconnect(move |session| {
        let resume_tx = resume_tx.clone();
        async move {
            resume_tx.send(session.id()).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let id = SessionId::generate();
    let mut client = RawClient::connect(handle.local_addr(), id).await;
    let session = session_rx.recv().await.unwrap();

    client.send(&Value::from("x")).await;
    let message = timeout(Duration::from_secs(5), session.receive()).await.unwrap().unwrap();
    assert_eq!(message.contents, Value::from("x"));

    // Sever the transport; the session must hold instead of closing.
    drop(client);
    wait_for_state(&session, SessionState::Reconnecting).await;

    // Values sent during the gap are buffered in order.
    session.send(&Value::from("y1")).await.unwrap();
    session.send(&Value::from("y2")).await.unwrap();

    let mut client = RawClient::connect(handle.local_addr(), id).await;
    assert_eq!(resume_rx.recv().await, Some(id));
    wait_for_state(&session, SessionState::Open).await;

    // Drained FIFO, before anything sent after the resume.
    session.send(&Value::from("z")).await.unwrap();
    assert_eq!(client.recv().await, Value::from("y1"));
    assert_eq!(client.recv().await, Value::from("y2"));
    assert_eq!(client.recv().await, Value::from("z"));

    // Still one logical session.
    assert_eq!(handle.session_count().await, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_window_expires_once() {
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_millis(300)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    server.on_client_disconnect(move |session| {
        let disconnect_tx = disconnect_tx.clone();
        async move {
            disconnect_tx.send(session.id()).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let id = SessionId::generate();
    let client = RawClient::connect(handle.local_addr(), id).await;
    let session = session_rx.recv().await.unwrap();
    drop(client);

    // The disconnect callback fires exactly once, after the grace period.
    let disconnected = timeout(Duration::from_secs(5), disconnect_rx.recv()).await.unwrap();
    assert_eq!(disconnected, Some(id));
    assert_eq!(session.state().await, SessionState::Closed);
    assert!(timeout(Duration::from_millis(200), disconnect_rx.recv()).await.is_err());
    assert_eq!(handle.session_count().await, 0);

    // Closed sessions reject further operations.
    match session.send(&Value::Null).await {
        Err(SessionError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    match session.receive().await {
        Err(SessionError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }

    // A latecomer with the same identifier is a brand new session.
    let _client = RawClient::connect(handle.local_addr(), id).await;
    let successor = timeout(Duration::from_secs(5), session_rx.recv()).await.unwrap().unwrap();
    assert_eq!(successor.id(), id);
    assert!(!Arc::ptr_eq(&session, &successor));
    assert_eq!(handle.session_count().await, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn tampered_frame_closes_session_without_delivery() {
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<Value>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_receiving_message(move |message| {
        let message_tx = message_tx.clone();
        async move {
            message_tx.send(message.contents).ok();
            Ok(())
        }
    });
    server.on_client_disconnect(move |session| {
        let disconnect_tx = disconnect_tx.clone();
        async move {
            disconnect_tx.send(session.id()).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let id = SessionId::generate();
    let mut client = RawClient::connect(handle.local_addr(), id).await;

    // A frame with a corrupted byte: authentic length, garbage body.
    let mut frame_bytes = {
        let mut plaintext = frame::unix_now().to_be_bytes().to_vec();
        plaintext.extend_from_slice(&Value::from("evil").to_bytes().unwrap());
        client.crypto.encrypt(&plaintext)
    };
    frame_bytes[40] ^= 0x01;
    let mut wire = (frame_bytes.len() as u16).to_be_bytes().to_vec();
    wire.extend_from_slice(&frame_bytes);
    use tokio::io::AsyncWriteExt;
    client.writer.write_all(&wire).await.unwrap();
    client.writer.flush().await.unwrap();

    // Fatal: the session closes; nothing is delivered to the application.
    assert_eq!(timeout(Duration::from_secs(5), disconnect_rx.recv()).await.unwrap(), Some(id));
    assert!(timeout(Duration::from_millis(200), message_rx.recv()).await.is_err());

    handle.shutdown().await;
}

#[tokio::test]
async fn duplicate_identifier_for_open_session_is_rejected() {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let id = SessionId::generate();
    let mut first = RawClient::connect(handle.local_addr(), id).await;
    let session = session_rx.recv().await.unwrap();

    // Second transport with the same identifier while the first is open:
    // the handshake completes but the transport is dropped right after.
    let mut second = RawClient::connect(handle.local_addr(), id).await;
    match frame::read_frame(&mut second.reader, &mut second.crypto).await {
        Err(SessionError::Io(_)) => {}
        other => panic!("expected the rejected transport to close, got {other:?}"),
    }

    // The original session is untouched.
    assert_eq!(session.state().await, SessionState::Open);
    assert_eq!(handle.session_count().await, 1);
    session.send(&Value::from("still here")).await.unwrap();
    assert_eq!(first.recv().await, Value::from("still here"));

    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_send_fails_locally() {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let connection = Connection::connect(handle.local_addr()).await.unwrap();
    let session = session_rx.recv().await.unwrap();

    let oversized = Value::Bytes(vec![0u8; frame::MAX_PAYLOAD_LEN]);
    match session.send(&oversized).await {
        Err(SessionError::TooLarge) => {}
        other => panic!("expected TooLarge, got {other:?}"),
    }
    match connection.send(&oversized).await {
        Err(SessionError::TooLarge) => {}
        other => panic!("expected TooLarge, got {other:?}"),
    }

    // The session survives the local error.
    session.send(&Value::from("fine")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(reply.contents, Value::from("fine"));

    handle.shutdown().await;
}

#[tokio::test]
async fn client_reconnect_after_server_side_close_is_a_new_session() {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let connection = Connection::connect(handle.local_addr()).await.unwrap();
    let session = session_rx.recv().await.unwrap();

    session.shutdown().await;
    // The client notices the dead link...
    match timeout(Duration::from_secs(5), connection.receive()).await.unwrap() {
        Err(SessionError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(!connection.is_connected());

    // Wait out the registry removal so the new transport cannot race the
    // disconnect hook and get rejected against the dying session.
    timeout(Duration::from_secs(5), async {
        while handle.session_count().await != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // ...and may come back under the same identifier as a fresh session.
    connection.reconnect().await.unwrap();
    let successor = timeout(Duration::from_secs(5), session_rx.recv()).await.unwrap().unwrap();
    assert_eq!(successor.id(), connection.id());

    connection.send(&Value::from("again")).await.unwrap();
    let message = timeout(Duration::from_secs(5), successor.receive()).await.unwrap().unwrap();
    assert_eq!(message.contents, Value::from("again"));

    handle.shutdown().await;
}

#[tokio::test]
async fn callback_errors_do_not_kill_the_session() {
    let mut server = Server::with_rsa_key(config(Duration::from_secs(5)), key());
    server.on_receiving_message(|message| async move {
        if message.contents == Value::from("boom") {
            return Err("handler exploded".into());
        }
        message.author.send(&message.contents).await?;
        Ok(())
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let connection = Connection::connect(handle.local_addr()).await.unwrap();
    connection.send(&Value::from("boom")).await.unwrap();
    connection.send(&Value::from("still alive")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(reply.contents, Value::from("still alive"));

    handle.shutdown().await;
}
