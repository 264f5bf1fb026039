use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use podwatch::podwatch::controller::informer::ResourceEvent;
use podwatch::podwatch::controller::runner::{
    ControllerRunner, Reconcile, ReconcileError, RunnerError, SyncToSink,
};
use podwatch::podwatch::controller::store::Store;
use podwatch::podwatch::k8s::meta::GroupVersionResource;
use podwatch::podwatch::models::SyncRecord;

use crate::support::{pod_list, pod_object, wait_until, CapturingNotifier, FakeSource};

fn sink_runner(
    source: Arc<FakeSource>,
    reconciler: Arc<dyn Reconcile>,
    workers: usize,
) -> ControllerRunner {
    ControllerRunner::new(
        GroupVersionResource::pods(),
        source,
        reconciler,
        workers,
        5,
        Duration::from_secs(3600),
    )
}

#[tokio::test]
async fn missing_key_is_treated_as_deletion() {
    let notifier = Arc::new(CapturingNotifier::default());
    let reconciler = SyncToSink::new(notifier.clone());

    reconciler
        .reconcile("default/web-1", &Store::new())
        .expect("deletion reconciles cleanly");

    let records = notifier.records();
    assert_eq!(records.len(), 1);
    match &records[0] {
        SyncRecord::Deleted(record) => {
            assert_eq!(record.namespace, "default");
            assert_eq!(record.name, "web-1");
        }
        other => panic!("expected a delete record, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_keys_are_not_retried() {
    let notifier = Arc::new(CapturingNotifier::default());
    let reconciler = SyncToSink::new(notifier.clone());

    reconciler
        .reconcile("not/a-valid/key-format", &Store::new())
        .expect("malformed keys resolve as success");
    assert!(notifier.records().is_empty(), "no record for a bad key");
}

#[tokio::test]
async fn observed_pod_is_mirrored_to_the_sink() {
    let source = FakeSource::new();
    source.set_fallback(pod_list(vec![pod_object("ns", "x", "Running", "node-3")]));
    let notifier = Arc::new(CapturingNotifier::default());
    let runner = sink_runner(source, Arc::new(SyncToSink::new(notifier.clone())), 2);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(runner.run(cancel.clone()));

    assert!(
        wait_until(Duration::from_secs(2), || {
            notifier
                .records()
                .iter()
                .any(|record| matches!(record, SyncRecord::Pod(pod) if pod.pod_name == "x"))
        })
        .await,
        "pod record reaches the sink"
    );

    let records = notifier.records();
    let pod = records
        .iter()
        .find_map(|record| match record {
            SyncRecord::Pod(pod) => Some(pod),
            _ => None,
        })
        .expect("pod record present");
    assert_eq!(pod.namespace, "ns");
    assert_eq!(pod.phase, "Running");
    assert_eq!(pod.node_name, "node-3");

    cancel.cancel();
    task.await.expect("runner joins").expect("runner exits cleanly");
}

struct FailingReconciler {
    calls: AtomicUsize,
}

impl Reconcile for FailingReconciler {
    fn reconcile(&self, _key: &str, _store: &Store) -> Result<(), ReconcileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ReconcileError::from("sink unavailable"))
    }
}

/// Five consecutive failures requeue with backoff; the sixth drops the
/// key. A fresh notification afterwards restarts the cycle from zero.
#[tokio::test]
async fn persistent_failures_drop_after_max_retries() {
    let (source, events) = FakeSource::with_events();
    source.push_list(pod_list(vec![pod_object("ns", "x", "Running", "node-3")]));
    source.set_fallback(pod_list(vec![pod_object("ns", "x", "Running", "node-3")]));

    let reconciler = Arc::new(FailingReconciler {
        calls: AtomicUsize::new(0),
    });
    let runner = sink_runner(source, reconciler.clone(), 1);
    let queue = runner.queue();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(runner.run(cancel.clone()));

    assert!(
        wait_until(Duration::from_secs(3), || {
            reconciler.calls.load(Ordering::SeqCst) == 6
        })
        .await,
        "six attempts then drop, saw {}",
        reconciler.calls.load(Ordering::SeqCst)
    );
    // The drop clears the retry history.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 6);
    assert_eq!(queue.num_requeues("ns/x"), 0);

    // A fresh notification restarts the retry cycle from zero.
    events
        .send(Ok(ResourceEvent::Modified(pod_object(
            "ns", "x", "Failed", "node-3",
        ))))
        .expect("event accepted");
    assert!(
        wait_until(Duration::from_secs(3), || {
            reconciler.calls.load(Ordering::SeqCst) == 12
        })
        .await,
        "the cycle restarts at zero, saw {}",
        reconciler.calls.load(Ordering::SeqCst)
    );

    cancel.cancel();
    task.await.expect("runner joins").expect("runner exits cleanly");
}

struct PhaseObserver {
    seen: Mutex<Vec<String>>,
}

impl Reconcile for PhaseObserver {
    fn reconcile(&self, key: &str, store: &Store) -> Result<(), ReconcileError> {
        use podwatch::podwatch::k8s::meta::KubeObject;
        let phase = match store.get(key) {
            Some(KubeObject::Pod(pod)) => pod
                .status
                .and_then(|status| status.phase)
                .unwrap_or_default(),
            Some(KubeObject::Node(_)) => String::new(),
            None => "<absent>".to_string(),
        };
        // Shorter than the redelivery path so updates pile up in flight.
        std::thread::sleep(Duration::from_millis(5));
        self.seen.lock().unwrap().push(phase);
        Ok(())
    }
}

/// Level-triggered law: whatever interleaving the queue produces, the
/// last reconcile before idle observes the state of the last notification.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_observation_matches_the_last_notification() {
    let (source, events) = FakeSource::with_events();
    source.push_list(pod_list(vec![pod_object("ns", "x", "Pending", "node-3")]));
    source.set_fallback(pod_list(vec![]));

    let reconciler = Arc::new(PhaseObserver {
        seen: Mutex::new(Vec::new()),
    });
    let runner = sink_runner(source, reconciler.clone(), 3);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(runner.run(cancel.clone()));

    for phase in ["ContainerCreating", "Running", "Succeeded"] {
        events
            .send(Ok(ResourceEvent::Modified(pod_object(
                "ns", "x", phase, "node-3",
            ))))
            .expect("event accepted");
    }

    assert!(
        wait_until(Duration::from_secs(3), || {
            reconciler
                .seen
                .lock()
                .unwrap()
                .last()
                .is_some_and(|phase| phase == "Succeeded")
        })
        .await,
        "final pass sees the last notified state: {:?}",
        reconciler.seen.lock().unwrap()
    );
    let observed = reconciler.seen.lock().unwrap().clone();
    assert!(!observed.is_empty());

    cancel.cancel();
    task.await.expect("runner joins").expect("runner exits cleanly");
}

/// Workers must not start before the initial list completed, or an empty
/// cache would be misread as mass deletion.
#[tokio::test]
async fn workers_wait_for_the_cache_sync_barrier() {
    let source = FakeSource::new();
    let gate = source.gate_lists();
    source.set_fallback(pod_list(vec![pod_object("ns", "x", "Running", "node-3")]));

    let notifier = Arc::new(CapturingNotifier::default());
    let runner = sink_runner(source, Arc::new(SyncToSink::new(notifier.clone())), 2);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(runner.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        notifier.records().is_empty(),
        "nothing reconciles before the list lands"
    );

    gate.add_permits(1);
    assert!(
        wait_until(Duration::from_secs(2), || !notifier.records().is_empty()).await,
        "reconciles start once the cache synced"
    );

    cancel.cancel();
    task.await.expect("runner joins").expect("runner exits cleanly");
}

struct PanicsOnce {
    calls: AtomicUsize,
}

impl Reconcile for PanicsOnce {
    fn reconcile(&self, _key: &str, _store: &Store) -> Result<(), ReconcileError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("reconcile blew up");
        }
        Ok(())
    }
}

/// A panic inside reconcile must release the in-flight hold and count as
/// a failed attempt; the key is retried and the worker keeps running.
#[tokio::test]
async fn a_reconcile_panic_does_not_wedge_the_key() {
    let source = FakeSource::new();
    source.set_fallback(pod_list(vec![pod_object("ns", "x", "Running", "node-3")]));

    let reconciler = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
    });
    let runner = sink_runner(source, reconciler.clone(), 1);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(runner.run(cancel.clone()));

    assert!(
        wait_until(Duration::from_secs(2), || {
            reconciler.calls.load(Ordering::SeqCst) >= 2
        })
        .await,
        "the key is retried after the panic"
    );

    cancel.cancel();
    task.await.expect("runner joins").expect("runner exits cleanly");
}

#[tokio::test]
async fn cache_sync_failure_is_fatal_for_the_runner() {
    let source = FakeSource::new();
    for _ in 0..8 {
        source.push_list_err("connection refused");
    }
    let notifier = Arc::new(CapturingNotifier::default());
    let runner = sink_runner(source, Arc::new(SyncToSink::new(notifier)), 1);

    let cancel = CancellationToken::new();
    let result = runner.run(cancel).await;
    assert!(matches!(result, Err(RunnerError::CacheSync { .. })));
}
