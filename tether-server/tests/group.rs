//! Group broadcast over live sessions: cycles, nesting, weak membership.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use tether_client::Connection;
use tether_crypto::rsa::{KEY_BITS, PrivateKey};
use tether_server::{Group, Server, ServerConfig, ServerHandle, Session, Value};

fn key() -> PrivateKey {
    static KEY: OnceLock<PrivateKey> = OnceLock::new();
    KEY.get_or_init(|| PrivateKey::generate(KEY_BITS)).clone()
}

/// Boot a server and connect `count` clients, returning the handle plus the
/// paired (server session, client connection) handles.
async fn cluster(count: usize) -> (ServerHandle, Vec<(Arc<Session>, Connection)>) {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut server = Server::with_rsa_key(
        ServerConfig { reconnect_timeout: Duration::from_secs(5), rsa_key_path: None },
        key(),
    );
    server.on_new_connection(move |session| {
        let session_tx = session_tx.clone();
        async move {
            session_tx.send(session).ok();
            Ok(())
        }
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let connection = Connection::connect(handle.local_addr()).await.unwrap();
        let session = timeout(Duration::from_secs(5), session_rx.recv()).await.unwrap().unwrap();
        assert_eq!(session.id(), connection.id());
        pairs.push((session, connection));
    }
    (handle, pairs)
}

async fn expect_value(connection: &Connection, wanted: &Value) {
    let message = timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(&message.contents, wanted);
}

async fn expect_silence(connection: &Connection) {
    assert!(
        timeout(Duration::from_millis(200), connection.receive()).await.is_err(),
        "received an unexpected message"
    );
}

#[tokio::test]
async fn delivers_to_every_member() {
    let (handle, pairs) = cluster(5).await;

    let group = Group::new();
    for (session, _) in &pairs {
        group.add(session);
    }
    assert_eq!(group.len(), 5);

    group.send(&Value::from("a")).await;
    for (_, connection) in &pairs {
        expect_value(connection, &Value::from("a")).await;
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn removed_members_stop_receiving() {
    let (handle, pairs) = cluster(2).await;
    let group = Group::new();
    group.add(&pairs[0].0);
    group.add(&pairs[1].0);

    group.send(&Value::from("a")).await;
    group.remove(&pairs[0].0);
    group.send(&Value::from("b")).await;

    expect_value(&pairs[0].1, &Value::from("a")).await;
    expect_silence(&pairs[0].1).await;
    expect_value(&pairs[1].1, &Value::from("a")).await;
    expect_value(&pairs[1].1, &Value::from("b")).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn add_and_remove_are_idempotent() {
    let (handle, pairs) = cluster(1).await;
    let group = Group::new();

    group.add(&pairs[0].0);
    group.add(&pairs[0].0);
    assert_eq!(group.len(), 1);
    group.send(&Value::from("once")).await;
    expect_value(&pairs[0].1, &Value::from("once")).await;
    expect_silence(&pairs[0].1).await;

    group.remove(&pairs[0].0);
    group.remove(&pairs[0].0); // absent: no-op
    assert!(group.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn nested_group_delivers_once() {
    let (handle, pairs) = cluster(1).await;
    let parent = Group::new();
    let child = Group::new();
    parent.add(&child);
    child.add(&pairs[0].0);

    parent.send(&Value::from("b")).await;
    expect_value(&pairs[0].1, &Value::from("b")).await;
    expect_silence(&pairs[0].1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn deeply_nested_chain_delivers_once() {
    let (handle, pairs) = cluster(1).await;

    let top = Group::new();
    let mut groups = vec![top.clone()];
    let mut previous = top.clone();
    for _ in 0..100 {
        let next = Group::new();
        previous.add(&next);
        groups.push(next.clone());
        previous = next;
    }
    previous.add(&pairs[0].0);

    top.send(&Value::from("c")).await;
    expect_value(&pairs[0].1, &Value::from("c")).await;
    expect_silence(&pairs[0].1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn cyclic_groups_terminate_and_deliver_once() {
    let (handle, pairs) = cluster(1).await;

    let group_1 = Group::new();
    let group_2 = Group::new();
    group_1.add(&group_2);
    group_2.add(&group_1);
    group_2.add(&pairs[0].0);

    group_1.send(&Value::from("a")).await;
    expect_value(&pairs[0].1, &Value::from("a")).await;
    expect_silence(&pairs[0].1).await;

    group_2.send(&Value::from("b")).await;
    expect_value(&pairs[0].1, &Value::from("b")).await;
    expect_silence(&pairs[0].1).await;

    // Membership through both arms of the cycle still means exactly once.
    group_1.add(&pairs[0].0);
    group_1.send(&Value::from("c")).await;
    expect_value(&pairs[0].1, &Value::from("c")).await;
    expect_silence(&pairs[0].1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn diamond_membership_delivers_once() {
    let (handle, pairs) = cluster(1).await;

    // root → {left, right} → shared → session
    let root = Group::new();
    let left = Group::new();
    let right = Group::new();
    let shared = Group::new();
    root.add(&left);
    root.add(&right);
    left.add(&shared);
    right.add(&shared);
    shared.add(&pairs[0].0);

    root.send(&Value::from("d")).await;
    expect_value(&pairs[0].1, &Value::from("d")).await;
    expect_silence(&pairs[0].1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn closed_sessions_drop_out() {
    let (handle, pairs) = cluster(2).await;
    let group = Group::new();
    group.add(&pairs[0].0);
    group.add(&pairs[1].0);

    pairs[0].0.shutdown().await;
    group.send(&Value::from("after")).await;

    expect_value(&pairs[1].1, &Value::from("after")).await;
    // The closed session's client sees its link die, not a delivery.
    assert!(
        timeout(Duration::from_secs(5), pairs[0].1.receive()).await.unwrap().is_err()
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn dropped_groups_vanish_from_parents() {
    let (handle, pairs) = cluster(1).await;

    let parent = Group::new();
    let child = Group::new();
    parent.add(&child);
    child.add(&pairs[0].0);
    assert_eq!(parent.len(), 1);

    drop(child);
    // Weak membership: the dead sub-group is pruned, nothing is reachable.
    parent.send(&Value::from("gone")).await;
    assert!(parent.is_empty());
    expect_silence(&pairs[0].1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_live_members_despite_a_dead_transport() {
    let (handle, pairs) = cluster(3).await;
    let group = Group::new();
    for (session, _) in &pairs {
        group.add(session);
    }

    // Kill the middle client's transport; its session lingers reconnecting,
    // so delivery to it buffers while the others receive immediately.
    pairs[1].1.close().await;
    sleep(Duration::from_millis(50)).await;

    group.send(&Value::from("best effort")).await;
    expect_value(&pairs[0].1, &Value::from("best effort")).await;
    expect_value(&pairs[2].1, &Value::from("best effort")).await;

    handle.shutdown().await;
}
