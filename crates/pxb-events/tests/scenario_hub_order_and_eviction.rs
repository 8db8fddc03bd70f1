//! Scenario: fan-out preserves order; slow subscribers are evicted.
//!
//! # Invariants under test
//! - A subscriber observes a channel's events in strictly increasing seq
//!   order.
//! - A subscriber whose queue is full is evicted from every channel; the
//!   publisher never blocks on it.
//! - After eviction, replay from the durable log recovers the missed events.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use pxb_events::{EventFabric, MemEventLog};

fn fabric(queue_depth: usize) -> EventFabric {
    EventFabric::new(Arc::new(MemEventLog::new()), queue_depth)
}

#[tokio::test]
async fn subscriber_sees_events_in_seq_order() {
    let fabric = fabric(64);
    let sub = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(64);
    fabric.hub().subscribe("entity:e", sub, tx).await;

    for i in 0..10 {
        fabric
            .publish("entity:e", "request.created", json!({"i": i}))
            .await
            .unwrap();
    }

    let mut last = 0;
    for _ in 0..10 {
        let frame = rx.recv().await.unwrap();
        assert!(frame.seq > last, "seq must strictly increase");
        last = frame.seq;
    }
    assert_eq!(last, 10);
}

#[tokio::test]
async fn full_queue_evicts_subscriber_and_publisher_continues() {
    let fabric = fabric(2);
    let slow = Uuid::new_v4();
    // queue depth 2 and nobody draining
    let (tx, mut rx) = mpsc::channel(2);
    fabric.hub().subscribe("entity:e", slow, tx).await;

    for i in 0..5 {
        fabric
            .publish("entity:e", "request.created", json!({"i": i}))
            .await
            .unwrap();
    }

    // the third publish overflowed the queue and evicted the subscriber
    assert!(fabric.hub().channels_of(slow).await.is_empty());

    // the two queued frames are still there; after that the stream ends
    assert_eq!(rx.recv().await.unwrap().seq, 1);
    assert_eq!(rx.recv().await.unwrap().seq, 2);
    assert!(rx.recv().await.is_none(), "evicted sender side is dropped");

    // all five events were durably sequenced regardless
    let all = fabric.replay("entity:e", 0, 100).await.unwrap();
    assert_eq!(all.len(), 5);

    // the eviction recovery path: resume from last processed seq
    let missed = fabric.replay("entity:e", 2, 100).await.unwrap();
    let seqs: Vec<i64> = missed.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![3, 4, 5]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let fabric = fabric(8);
    let sub = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    fabric.hub().subscribe("entity:e", sub, tx).await;

    fabric
        .publish("entity:e", "request.created", json!({}))
        .await
        .unwrap();
    fabric.hub().unsubscribe("entity:e", sub).await;
    fabric
        .publish("entity:e", "request.claimed", json!({}))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().seq, 1);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn dispatch_only_reaches_the_records_channel() {
    let fabric = fabric(8);
    let sub = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    fabric.hub().subscribe("entity:a", sub, tx).await;

    fabric
        .publish("entity:b", "request.created", json!({}))
        .await
        .unwrap();
    fabric
        .publish("entity:a", "request.created", json!({}))
        .await
        .unwrap();

    let frame = rx.recv().await.unwrap();
    assert_eq!(frame.channel, "entity:a");
}
