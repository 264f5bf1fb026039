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
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::podwatch::controller::queue::EnqueueKey;
use crate::podwatch::controller::store::{object_key, Store};
use crate::podwatch::k8s::meta::KubeObject;
use crate::podwatch::logger::{log_debug, log_error, log_info, log_warn};

const COMPONENT: &str = "controller.informer";
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const INITIAL_LIST_ATTEMPTS: u32 = 5;

pub type SourceError = Box<dyn Error + Send + Sync>;
pub type ListFuture<'a> = Pin<Box<dyn Future<Output = Result<ResourceList, SourceError>> + Send + 'a>>;
pub type EventStream = BoxStream<'static, Result<ResourceEvent, SourceError>>;
pub type WatchFuture<'a> = Pin<Box<dyn Future<Output = Result<EventStream, SourceError>> + Send + 'a>>;

/// The change-stream collaborator: a full list plus an incremental watch
/// from the list's resource version. The engine never sees transport
/// details, only this seam.
pub trait ChangeSource: Send + Sync {
    fn list(&self) -> ListFuture<'_>;
    fn watch(&self, resource_version: &str) -> WatchFuture<'_>;
}

/// One observed change. Delete events still carry the object's last-known
/// identity so the key can be derived without a cache hit.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Added(KubeObject),
    Modified(KubeObject),
    Deleted(KubeObject),
    Bookmark,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub resource_version: Option<String>,
    pub items: Vec<KubeObject>,
}

/// Why a watch session ended. `delivered` records whether the session
/// produced any event before dropping; a session that never did keeps the
/// reconnect delay growing.
enum WatchOutcome {
    Cancelled,
    Resync,
    Disconnected { delivered: bool },
}

/// Keeps the keyed cache in sync with the change stream and translates
/// every change into an `enqueue(key)` call. No business logic runs here;
/// the hot path only derives keys.
pub struct Informer {
    label: String,
    source: Arc<dyn ChangeSource>,
    store: Store,
    sink: Arc<dyn EnqueueKey>,
    resync_interval: Duration,
    synced: watch::Sender<bool>,
}

impl Informer {
    pub fn new(
        label: &str,
        source: Arc<dyn ChangeSource>,
        store: Store,
        sink: Arc<dyn EnqueueKey>,
        resync_interval: Duration,
    ) -> (Self, watch::Receiver<bool>) {
        let (synced, synced_rx) = watch::channel(false);
        (
            Self {
                label: label.to_string(),
                source,
                store,
                sink,
                resync_interval,
                synced,
            },
            synced_rx,
        )
    }

    /// Drives list+watch until cancelled. Returns early only when the
    /// initial list never completes; that drops the sync barrier sender,
    /// which the runner treats as fatal for this resource kind.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = BACKOFF_INITIAL;
        let mut watch_backoff = BACKOFF_INITIAL;
        let mut list_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let list = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.source.list() => result,
            };

            let list = match list {
                Ok(list) => list,
                Err(err) => {
                    list_failures += 1;
                    let never_synced = !*self.synced.borrow();
                    if never_synced && list_failures >= INITIAL_LIST_ATTEMPTS {
                        log_error(
                            COMPONENT,
                            "initial list never completed, giving up on this resource",
                            &[
                                ("resource", &self.label),
                                ("attempts", &list_failures.to_string()),
                                ("error", &err.to_string()),
                            ],
                        );
                        return;
                    }
                    log_warn(
                        COMPONENT,
                        "list failed, backing off",
                        &[("resource", &self.label), ("error", &err.to_string())],
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };
            backoff = BACKOFF_INITIAL;
            list_failures = 0;

            let resource_version = list.resource_version.clone().unwrap_or_default();
            self.replay_list(list);

            if !self.synced.send_replace(true) {
                log_info(
                    COMPONENT,
                    "cache synced",
                    &[
                        ("resource", &self.label),
                        ("objects", &self.store.len().to_string()),
                    ],
                );
            }

            match self.watch_until_disconnect(&cancel, &resource_version).await {
                WatchOutcome::Cancelled => return,
                // A resync relist is scheduled, not a failure; no delay.
                WatchOutcome::Resync => watch_backoff = BACKOFF_INITIAL,
                WatchOutcome::Disconnected { delivered } => {
                    if delivered {
                        watch_backoff = BACKOFF_INITIAL;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(watch_backoff) => {}
                    }
                    watch_backoff = next_backoff(watch_backoff);
                }
            }
        }
    }

    /// Replays a full snapshot: replaces the cache and enqueues every
    /// listed key plus every key the relist discovered as deleted.
    fn replay_list(&self, list: ResourceList) {
        let mut keyed = Vec::with_capacity(list.items.len());
        for object in list.items {
            let key = object_key(object.metadata());
            if key.is_empty() {
                continue;
            }
            keyed.push((key, object));
        }
        let keys: Vec<String> = keyed.iter().map(|(key, _)| key.clone()).collect();
        let vanished = self.store.replace(keyed);

        for key in keys {
            self.sink.enqueue(&key);
        }
        // Deletions the watch stream missed, keyed from the last-known
        // cached identity.
        for key in vanished {
            self.sink.enqueue(&key);
        }
    }

    /// Consumes watch events until the stream drops, the resync interval
    /// elapses, or cancellation. A disconnect reports whether the session
    /// delivered anything; a dead-on-arrival watch keeps doubling the
    /// reconnect delay instead of relisting in a tight loop.
    async fn watch_until_disconnect(
        &self,
        cancel: &CancellationToken,
        resource_version: &str,
    ) -> WatchOutcome {
        let mut stream = match self.source.watch(resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "watch connect failed, backing off before relist",
                    &[("resource", &self.label), ("error", &err.to_string())],
                );
                return WatchOutcome::Disconnected { delivered: false };
            }
        };

        let resync = sleep(self.resync_interval);
        tokio::pin!(resync);
        let mut delivered = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = &mut resync => {
                    log_debug(
                        COMPONENT,
                        "resync interval elapsed, relisting",
                        &[("resource", &self.label)],
                    );
                    return WatchOutcome::Resync;
                }
                event = stream.next() => match event {
                    None => {
                        log_debug(
                            COMPONENT,
                            "watch stream ended, relisting",
                            &[("resource", &self.label)],
                        );
                        return WatchOutcome::Disconnected { delivered };
                    }
                    Some(Err(err)) => {
                        log_warn(
                            COMPONENT,
                            "watch stream failed, relisting",
                            &[("resource", &self.label), ("error", &err.to_string())],
                        );
                        return WatchOutcome::Disconnected { delivered };
                    }
                    Some(Ok(event)) => {
                        delivered = true;
                        self.apply_event(event);
                    }
                },
            }
        }
    }

    fn apply_event(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Added(object) | ResourceEvent::Modified(object) => {
                let key = object_key(object.metadata());
                if key.is_empty() {
                    log_warn(
                        COMPONENT,
                        "event object carries no identity, skipping",
                        &[("resource", &self.label)],
                    );
                    return;
                }
                self.store.insert(key.clone(), object);
                self.sink.enqueue(&key);
            }
            ResourceEvent::Deleted(object) => {
                let key = object_key(object.metadata());
                if key.is_empty() {
                    log_warn(
                        COMPONENT,
                        "delete event carries no identity, skipping",
                        &[("resource", &self.label)],
                    );
                    return;
                }
                self.store.remove(&key);
                self.sink.enqueue(&key);
            }
            ResourceEvent::Bookmark => {}
        }
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    current.checked_mul(2).unwrap_or(BACKOFF_MAX).min(BACKOFF_MAX)
}
