use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use podwatch::podwatch::controller::informer::{Informer, ResourceEvent};
use podwatch::podwatch::controller::store::Store;

use crate::support::{pod_list, pod_object, wait_until, FakeSource, RecordingSink};

const LONG_RESYNC: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn initial_list_populates_cache_and_enqueues_every_key() {
    let source = FakeSource::new();
    source.set_fallback(pod_list(vec![
        pod_object("default", "web-1", "Running", "node-1"),
        pod_object("default", "web-2", "Pending", "node-2"),
    ]));

    let store = Store::new();
    let sink = Arc::new(RecordingSink::default());
    let (informer, mut synced) =
        Informer::new("v1/pods", source, store.clone(), sink.clone(), LONG_RESYNC);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    synced
        .wait_for(|ready| *ready)
        .await
        .expect("cache syncs");

    assert_eq!(store.len(), 2);
    assert!(store.get("default/web-1").is_some());
    let mut keys = sink.keys();
    keys.sort();
    assert_eq!(keys, vec!["default/web-1", "default/web-2"]);

    cancel.cancel();
    task.await.expect("informer stops");
}

#[tokio::test]
async fn watch_events_update_cache_and_enqueue() {
    let (source, events) = FakeSource::with_events();
    source.set_fallback(pod_list(vec![]));

    let store = Store::new();
    let sink = Arc::new(RecordingSink::default());
    let (informer, mut synced) =
        Informer::new("v1/pods", source, store.clone(), sink.clone(), LONG_RESYNC);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    synced.wait_for(|ready| *ready).await.expect("cache syncs");

    events
        .send(Ok(ResourceEvent::Added(pod_object(
            "ns", "x", "Pending", "node-3",
        ))))
        .expect("event accepted");
    assert!(
        wait_until(Duration::from_secs(1), || store.get("ns/x").is_some()).await,
        "add lands in the cache"
    );

    events
        .send(Ok(ResourceEvent::Deleted(pod_object(
            "ns", "x", "Pending", "node-3",
        ))))
        .expect("event accepted");
    assert!(
        wait_until(Duration::from_secs(1), || store.get("ns/x").is_none()).await,
        "delete removes the cache entry"
    );

    let keys = sink.keys();
    assert_eq!(
        keys.iter().filter(|key| key.as_str() == "ns/x").count(),
        2,
        "both notifications enqueue the key: {keys:?}"
    );

    cancel.cancel();
    task.await.expect("informer stops");
}

/// A relist that no longer contains a cached object is a deletion the
/// watch stream missed; the vanished key is enqueued from its last-known
/// identity.
#[tokio::test]
async fn relist_enqueues_vanished_keys() {
    let source = FakeSource::new();
    source.push_list(pod_list(vec![
        pod_object("default", "web-1", "Running", "node-1"),
        pod_object("default", "web-2", "Running", "node-2"),
    ]));
    source.set_fallback(pod_list(vec![pod_object(
        "default", "web-2", "Running", "node-2",
    )]));

    let store = Store::new();
    let sink = Arc::new(RecordingSink::default());
    let (informer, mut synced) = Informer::new(
        "v1/pods",
        source,
        store.clone(),
        sink.clone(),
        Duration::from_millis(50),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    synced.wait_for(|ready| *ready).await.expect("cache syncs");

    assert!(
        wait_until(Duration::from_secs(2), || store
            .get("default/web-1")
            .is_none())
        .await,
        "relist drops the vanished object"
    );
    let keys = sink.keys();
    assert!(
        keys.iter().filter(|key| key.as_str() == "default/web-1").count() >= 2,
        "vanished key re-enqueued on relist: {keys:?}"
    );

    cancel.cancel();
    task.await.expect("informer stops");
}

/// A server that accepts lists but refuses watches must not be hammered
/// with full lists in a tight loop; each failed watch session doubles the
/// delay before the next relist.
#[tokio::test]
async fn failed_watch_sessions_back_off_before_relisting() {
    let source = FakeSource::new();
    source.set_fallback(pod_list(vec![pod_object(
        "default", "web-1", "Running", "node-1",
    )]));
    source.fail_watches();

    let store = Store::new();
    let sink = Arc::new(RecordingSink::default());
    let (informer, mut synced) = Informer::new(
        "v1/pods",
        source.clone(),
        store,
        sink,
        LONG_RESYNC,
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    synced.wait_for(|ready| *ready).await.expect("cache syncs");

    // Delays of 200ms, 400ms, 800ms... allow at most a handful of list
    // cycles in this window; a busy loop would rack up thousands.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let lists = source.list_calls();
    assert!(
        (2..=6).contains(&lists),
        "relists must be paced by backoff, saw {lists}"
    );

    cancel.cancel();
    task.await.expect("informer stops");
}

#[tokio::test]
async fn repeated_list_failures_drop_the_sync_barrier() {
    let source = FakeSource::new();
    // No fallback: every list attempt fails.
    for _ in 0..8 {
        source.push_list_err("connection refused");
    }

    let store = Store::new();
    let sink = Arc::new(RecordingSink::default());
    let (informer, mut synced) =
        Informer::new("v1/pods", source, store, sink, LONG_RESYNC);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    let result = synced.wait_for(|ready| *ready).await;
    assert!(result.is_err(), "barrier sender must drop, not sync");
    task.await.expect("informer gave up");
}
