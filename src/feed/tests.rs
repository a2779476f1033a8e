//! Feed fanout tests

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use super::{Feed, PublishEvent};
use crate::protocol::{Publish, QoS};

fn test_event() -> PublishEvent {
    PublishEvent {
        filter: Arc::from("-"),
        packet: Arc::new(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Arc::from("foo/bar/baz"),
            packet_id: Some(10),
            payload: Bytes::from_static(b"abcde"),
        }),
    }
}

fn cancel_pair() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

#[tokio::test]
async fn fanout_to_all_subscribers() {
    let feed = Arc::new(Feed::new("-"));
    let event = test_event();

    const N: usize = 1000;
    let mut tasks = Vec::with_capacity(N);
    for i in 0..N {
        let (tx, mut rx) = mpsc::channel::<PublishEvent>(1);
        let sub = feed.subscribe(tx);
        let expected = event.packet.clone();
        tasks.push(tokio::spawn(async move {
            let received = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("{}: receive timeout", i))
                .expect("channel closed before delivery");
            assert_eq!(received.packet, expected);
            sub.unsubscribe().await;
        }));
    }

    assert_eq!(feed.pending_len(), N);
    assert_eq!(feed.active_len().await, 0);

    let (_keep, mut cancel) = cancel_pair();
    let delivered = feed.publish(&mut cancel, event.clone()).await;
    assert_eq!(delivered, N);

    for task in tasks {
        task.await.unwrap();
    }

    // every subscriber has unsubscribed; a second publish reaches nobody
    let delivered = feed.publish(&mut cancel, event).await;
    assert_eq!(delivered, 0);
    assert_eq!(feed.active_len().await, 0);
}

#[tokio::test]
async fn unsubscribe_from_pending() {
    let feed = Arc::new(Feed::new("-"));
    let (ch1, _rx1) = mpsc::channel::<PublishEvent>(1);
    let (ch2, _rx2) = mpsc::channel::<PublishEvent>(1);

    let sub1 = feed.subscribe(ch1.clone());
    let sub2 = feed.subscribe(ch1);
    let sub3 = feed.subscribe(ch2);

    assert_eq!(feed.pending_len(), 3);
    assert_eq!(feed.active_len().await, 0);

    sub1.unsubscribe().await;
    sub2.unsubscribe().await;
    sub3.unsubscribe().await;

    // none of them ever reaches the active set
    assert_eq!(feed.pending_len(), 0);
    assert_eq!(feed.active_len().await, 0);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let feed = Arc::new(Feed::new("-"));
    let (ch1, mut rx1) = mpsc::channel::<PublishEvent>(1);
    let (ch2, mut rx2) = mpsc::channel::<PublishEvent>(1);
    let sub1 = feed.subscribe(ch1);
    let _sub2 = feed.subscribe(ch2);

    sub1.unsubscribe().await;
    sub1.unsubscribe().await;
    sub1.unsubscribe().await;
    assert_eq!(feed.pending_len(), 1);

    let (_keep, mut cancel) = cancel_pair();
    let delivered = feed.publish(&mut cancel, test_event()).await;
    assert_eq!(delivered, 1);
    assert!(rx2.recv().await.is_some());
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_during_publish() {
    let feed = Arc::new(Feed::new("-"));
    let event = test_event();

    // rendezvous-like channels: the publisher must wait for each receiver
    let (ch1, mut rx1) = mpsc::channel::<PublishEvent>(1);
    let (ch2, mut rx2) = mpsc::channel::<PublishEvent>(1);
    // occupy the buffers so the first try-send pass cannot finish early
    ch1.try_send(event.clone()).unwrap();
    ch2.try_send(event.clone()).unwrap();

    let sub1 = feed.subscribe(ch1);
    let sub2 = feed.subscribe(ch2);

    let publisher = {
        let feed = feed.clone();
        let event = event.clone();
        tokio::spawn(async move {
            let (_keep, mut cancel) = cancel_pair();
            feed.publish(&mut cancel, event).await
        })
    };

    // drain the plug, then the publish delivery, then unsubscribe
    rx1.recv().await.unwrap();
    rx1.recv().await.unwrap();
    sub1.unsubscribe().await;

    rx2.recv().await.unwrap();
    rx2.recv().await.unwrap();
    assert_eq!(publisher.await.unwrap(), 2);

    // active shrank by exactly one
    assert_eq!(feed.active_len().await, 1);

    sub2.unsubscribe().await;
    assert_eq!(feed.active_len().await, 0);
}

#[tokio::test]
async fn cancelled_publish_returns_partial_count() {
    let feed = Arc::new(Feed::new("-"));
    let event = test_event();

    // one ready receiver, one permanently blocked receiver
    let (ready_tx, mut ready_rx) = mpsc::channel::<PublishEvent>(1);
    let (stuck_tx, _stuck_rx) = mpsc::channel::<PublishEvent>(1);
    stuck_tx.try_send(event.clone()).unwrap(); // buffer full, never drained

    let _sub1 = feed.subscribe(ready_tx);
    let _sub2 = feed.subscribe(stuck_tx);

    let (cancel_tx, mut cancel) = cancel_pair();
    let publisher = {
        let feed = feed.clone();
        let event = event.clone();
        tokio::spawn(async move { feed.publish(&mut cancel, event).await })
    };

    // the ready subscriber is served by the try-send pass
    assert!(
        timeout(Duration::from_secs(2), ready_rx.recv())
            .await
            .unwrap()
            .is_some()
    );

    cancel_tx.send(()).unwrap();
    assert_eq!(publisher.await.unwrap(), 1);
}

#[tokio::test]
async fn pending_integration_deferred_to_next_publish() {
    let feed = Arc::new(Feed::new("-"));
    let (ch1, mut rx1) = mpsc::channel::<PublishEvent>(4);
    let _sub1 = feed.subscribe(ch1);

    let (_keep, mut cancel) = cancel_pair();
    assert_eq!(feed.publish(&mut cancel, test_event()).await, 1);
    assert!(rx1.recv().await.is_some());

    // subscribed after the publish started: not delivered to until the next
    let (ch2, mut rx2) = mpsc::channel::<PublishEvent>(4);
    let _sub2 = feed.subscribe(ch2);
    assert_eq!(feed.pending_len(), 1);

    assert_eq!(feed.publish(&mut cancel, test_event()).await, 2);
    assert!(rx1.recv().await.is_some());
    assert!(rx2.recv().await.is_some());
    assert_eq!(feed.pending_len(), 0);
    assert_eq!(feed.active_len().await, 2);
}
