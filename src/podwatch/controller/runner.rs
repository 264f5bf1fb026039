/*
 * Copyright (C) 2025 The Podwatch Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::podwatch::controller::informer::{ChangeSource, Informer};
use crate::podwatch::controller::queue::{EnqueueKey, WorkQueue};
use crate::podwatch::controller::store::{split_key, Store};
use crate::podwatch::k8s::meta::{GroupVersionResource, KubeObject};
use crate::podwatch::logger::{log_error, log_info, log_warn};
use crate::podwatch::models::{DeletedRecord, NodeRecord, Notifier, PodRecord, SyncRecord};

const COMPONENT: &str = "controller.runner";

pub type ReconcileError = Box<dyn Error + Send + Sync>;

/// Per-resource-kind reconcile logic. Called with a key and the current
/// cache; the cache is re-read here, never the notification payload, so a
/// pass always observes the freshest known state. Implementations must be
/// side-effect idempotent: delivery is at-least-once.
pub trait Reconcile: Send + Sync {
    fn reconcile(&self, key: &str, store: &Store) -> Result<(), ReconcileError>;
}

/// The shipped reconciler: mirror the observed object (or its absence)
/// into a flat record and hand it to the sink.
pub struct SyncToSink {
    notifier: Arc<dyn Notifier>,
}

impl SyncToSink {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl Reconcile for SyncToSink {
    fn reconcile(&self, key: &str, store: &Store) -> Result<(), ReconcileError> {
        let Some(object) = store.get(key) else {
            // Absent from the cache means deleted. A key that does not
            // split is unrecoverable; retrying cannot fix it.
            let (namespace, name) = match split_key(key) {
                Ok(parts) => parts,
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "invalid resource key, skipping",
                        &[("key", key), ("error", &err.to_string())],
                    );
                    return Ok(());
                }
            };
            log_info(
                COMPONENT,
                "object deleted",
                &[
                    ("namespace", namespace.unwrap_or_default()),
                    ("name", name),
                ],
            );
            self.notifier
                .notify(&SyncRecord::Deleted(DeletedRecord::new(namespace, name)));
            return Ok(());
        };

        match object {
            KubeObject::Pod(pod) => {
                self.notifier
                    .notify(&SyncRecord::Pod(PodRecord::from_pod(&pod)));
            }
            KubeObject::Node(node) => {
                self.notifier
                    .notify(&SyncRecord::Node(NodeRecord::from_node(&node)));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum RunnerError {
    CacheSync { resource: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::CacheSync { resource } => {
                write!(f, "cache sync failed for {resource}")
            }
        }
    }
}

impl Error for RunnerError {}

/// Orchestrates one reconciliation engine for one resource kind: informer,
/// keyed cache, work queue and worker pool. Runners share nothing; each
/// watched kind gets its own instance.
pub struct ControllerRunner {
    gvr: GroupVersionResource,
    source: Arc<dyn ChangeSource>,
    reconciler: Arc<dyn Reconcile>,
    store: Store,
    queue: WorkQueue,
    workers: usize,
    max_retries: u32,
    resync_interval: Duration,
}

impl ControllerRunner {
    pub fn new(
        gvr: GroupVersionResource,
        source: Arc<dyn ChangeSource>,
        reconciler: Arc<dyn Reconcile>,
        workers: usize,
        max_retries: u32,
        resync_interval: Duration,
    ) -> Self {
        Self {
            gvr,
            source,
            reconciler,
            store: Store::new(),
            queue: WorkQueue::new(),
            workers: workers.max(1),
            max_retries,
            resync_interval,
        }
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Runs until `cancel` fires. Workers start only after the initial
    /// list landed in the cache; an early reconcile against an unsynced
    /// cache would misread absence as deletion.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunnerError> {
        let label = self.gvr.to_string();
        log_info(COMPONENT, "starting controller", &[("resource", &label)]);

        let (informer, mut synced) = Informer::new(
            &label,
            Arc::clone(&self.source),
            self.store.clone(),
            Arc::new(self.queue.clone()) as Arc<dyn EnqueueKey>,
            self.resync_interval,
        );
        let informer_task = tokio::spawn(informer.run(cancel.clone()));

        if synced.wait_for(|ready| *ready).await.is_err() {
            // The informer gave up before the first list completed. Fatal
            // for this resource kind only.
            let _ = informer_task.await;
            self.queue.shut_down();
            if cancel.is_cancelled() {
                return Ok(());
            }
            return Err(RunnerError::CacheSync { resource: label });
        }

        log_info(
            COMPONENT,
            "cache synced, starting workers",
            &[
                ("resource", &label),
                ("workers", &self.workers.to_string()),
            ],
        );

        let mut worker_tasks = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let label = label.clone();
            let max_retries = self.max_retries;
            worker_tasks.push(tokio::spawn(async move {
                worker_loop(queue, store, reconciler, max_retries, label).await;
            }));
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        for task in worker_tasks {
            let _ = task.await;
        }
        let _ = informer_task.await;
        log_info(COMPONENT, "controller stopped", &[("resource", &label)]);
        Ok(())
    }
}

/// Releases the in-flight hold on drop so the queue's bookkeeping stays
/// correct on every exit path, including an unwind out of reconcile.
struct DoneGuard {
    queue: WorkQueue,
    key: String,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

async fn worker_loop(
    queue: WorkQueue,
    store: Store,
    reconciler: Arc<dyn Reconcile>,
    max_retries: u32,
    label: String,
) {
    while let Some(key) = queue.get().await {
        let _done = DoneGuard {
            queue: queue.clone(),
            key: key.clone(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| reconciler.reconcile(&key, &store)));
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "reconcile panicked".to_string());
                Err(ReconcileError::from(message))
            }
        };

        apply_retry_policy(&queue, &key, result, max_retries, &label);
    }
}

/// The retry state machine: success forgets the key's history; a failure
/// under the retry cap requeues with backoff; past the cap the key is
/// dropped, its history cleared and the error reported to the log sink.
fn apply_retry_policy(
    queue: &WorkQueue,
    key: &str,
    result: Result<(), ReconcileError>,
    max_retries: u32,
    label: &str,
) {
    let err = match result {
        Ok(()) => {
            queue.forget(key);
            return;
        }
        Err(err) => err,
    };

    if queue.num_requeues(key) < max_retries {
        log_info(
            COMPONENT,
            "error syncing object, will retry",
            &[
                ("resource", label),
                ("key", key),
                ("error", &err.to_string()),
            ],
        );
        queue.add_rate_limited(key);
        return;
    }

    queue.forget(key);
    log_error(
        COMPONENT,
        "dropping object out of the queue",
        &[
            ("resource", label),
            ("key", key),
            ("retries", &max_retries.to_string()),
            ("error", &err.to_string()),
        ],
    );
}
