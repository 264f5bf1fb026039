use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use podwatch::podwatch::controller::queue::WorkQueue;

/// Many duplicate adds for one key must never let two consumers hold the
/// key at the same time, and every delivery happens between a `get` and
/// its matching `done`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_adds_never_overlap() {
    let queue = WorkQueue::new();
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let in_flight = Arc::clone(&in_flight);
        let overlaps = Arc::clone(&overlaps);
        let deliveries = Arc::clone(&deliveries);
        consumers.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                {
                    let mut held = in_flight.lock().unwrap();
                    if !held.insert(key.clone()) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                }
                deliveries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight.lock().unwrap().remove(&key);
                queue.done(&key);
            }
        }));
    }

    for round in 0..100 {
        queue.add("default/web-1");
        queue.add("default/web-2");
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // Let the consumers drain, then shut down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.shut_down();
    for consumer in consumers {
        consumer.await.expect("consumer joins");
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "a key was held twice");
    let delivered = deliveries.load(Ordering::SeqCst);
    assert!(delivered >= 2, "each key must be delivered at least once");
    // Dedup: far fewer deliveries than adds.
    assert!(delivered < 200, "dedup failed: {delivered} deliveries");
}

#[tokio::test]
async fn rate_limited_adds_come_back() {
    let queue = WorkQueue::new();
    queue.add_rate_limited("ns/x");
    let key = timeout(Duration::from_secs(1), queue.get())
        .await
        .expect("redelivery within the deadline")
        .expect("queue is not shut down");
    assert_eq!(key, "ns/x");
    assert_eq!(queue.num_requeues("ns/x"), 1);
}

#[tokio::test]
async fn failure_counter_tracks_consecutive_requeues() {
    let queue = WorkQueue::new();
    for _ in 0..6 {
        queue.add_rate_limited("ns/x");
    }
    assert_eq!(queue.num_requeues("ns/x"), 6);
    queue.forget("ns/x");
    assert_eq!(queue.num_requeues("ns/x"), 0);
}

#[tokio::test]
async fn shutdown_abandons_pending_keys() {
    let queue = WorkQueue::new();
    queue.add("a");
    queue.add("b");
    queue.add("c");
    queue.shut_down();
    assert_eq!(queue.get().await, None);
    assert!(queue.is_shutting_down());
}

/// A key re-added while in flight is delivered exactly once more after
/// `done`, so the consumer re-reads state as of the last notification.
#[tokio::test]
async fn in_flight_adds_redeliver_exactly_once() {
    let queue = WorkQueue::new();
    queue.add("ns/x");
    let key = queue.get().await.expect("first delivery");

    queue.add("ns/x");
    queue.add("ns/x");
    queue.add("ns/x");
    queue.done(&key);

    let key = timeout(Duration::from_secs(1), queue.get())
        .await
        .expect("redelivery")
        .expect("queue live");
    assert_eq!(key, "ns/x");
    queue.done(&key);

    // No further redelivery: the queue is idle now.
    queue.shut_down();
    assert_eq!(queue.get().await, None);
}
