use std::sync::Arc;
use std::time::Duration;

use tether_proto::Queue;
use tokio::time::timeout;

#[test]
fn simple_fifo() {
    let q = Queue::new();
    q.push(1);
    q.push(2);
    assert_eq!(q.try_pop(), Some(1));
    assert_eq!(q.try_pop(), Some(2));
    assert_eq!(q.len(), 0);
}

#[test]
fn long_queue_preserves_order() {
    let q = Queue::new();
    for i in 0..10_000 {
        q.push(i);
    }
    for expected in 0..10_000 {
        assert_eq!(q.try_pop(), Some(expected));
    }
    assert!(q.is_empty());
}

#[test]
fn empty_try_pop() {
    let q: Queue<i32> = Queue::new();
    assert_eq!(q.try_pop(), None);
    q.push(2);
    q.try_pop();
    assert_eq!(q.try_pop(), None);
}

#[tokio::test]
async fn pop_returns_buffered_items() {
    let q = Queue::new();
    q.push(2);
    q.push(4);
    assert_eq!(q.pop().await, Some(2));
    assert_eq!(q.pop().await, Some(4));
}

#[tokio::test]
async fn pop_waits_when_empty() {
    let q: Queue<i32> = Queue::new();
    assert!(timeout(Duration::from_millis(50), q.pop()).await.is_err());

    q.push(1);
    q.pop().await;
    assert!(timeout(Duration::from_millis(50), q.pop()).await.is_err());
}

#[tokio::test]
async fn pop_wakes_on_push() {
    let q = Arc::new(Queue::new());
    let popper = {
        let q = q.clone();
        tokio::spawn(async move { q.pop().await })
    };
    tokio::task::yield_now().await;
    q.push(3);
    assert_eq!(popper.await.unwrap(), Some(3));
}

#[tokio::test]
async fn mixed_sync_and_async_pop() {
    let q = Queue::new();
    q.push(1);
    q.push(2);
    assert_eq!(q.try_pop(), Some(1));
    assert_eq!(q.pop().await, Some(2));
}

#[tokio::test]
async fn close_drains_then_ends() {
    let q = Queue::new();
    q.push(1);
    q.push(2);
    q.close();
    assert_eq!(q.pop().await, Some(1));
    assert_eq!(q.pop().await, Some(2));
    assert_eq!(q.pop().await, None);
    assert_eq!(q.pop().await, None);
}

#[tokio::test]
async fn close_wakes_waiting_popper() {
    let q: Arc<Queue<i32>> = Arc::new(Queue::new());
    let popper = {
        let q = q.clone();
        tokio::spawn(async move { q.pop().await })
    };
    tokio::task::yield_now().await;
    q.close();
    assert_eq!(popper.await.unwrap(), None);
}

#[test]
fn push_after_close_is_dropped() {
    let q = Queue::new();
    assert!(q.push(1));
    q.close();
    assert!(!q.push(2));
    assert_eq!(q.len(), 1);
}
