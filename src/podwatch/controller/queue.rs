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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Narrow capability handed to the change-stream side: all it may do is
/// enqueue a key.
pub trait EnqueueKey: Send + Sync {
    fn enqueue(&self, key: &str);
}

/// Deduplicating, rate-limited work queue of object keys.
///
/// Invariants, enforced under one lock:
/// - a key is delivered to at most one consumer between `get` and the
///   matching `done`;
/// - adding a key that is queued but not yet delivered is a no-op;
/// - adding a key that is in flight marks it dirty, and `done` re-queues
///   it exactly once, so the consumer always gets another pass over the
///   state as of the last notification.
///
/// Handles are cheap clones sharing the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

struct QueueState {
    ready: VecDeque<String>,
    // Keys queued or in flight with a pending redelivery.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    ready: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Queues `key` for delivery. Idempotent while the key is already
    /// queued; if the key is in flight it is marked dirty instead and
    /// redelivered after the current pass completes.
    pub fn add(&self, key: &str) {
        let mut state = self.lock_state();
        if state.shutting_down {
            return;
        }
        if state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.ready.push_back(key.to_string());
        drop(state);
        self.inner.wakeup.notify_one();
    }

    /// Blocks until a key is available or the queue shut down. `None`
    /// means shutdown: pending keys are abandoned, no key is returned.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.wakeup.notified();
            tokio::pin!(notified);
            // Register for a wakeup before re-checking the state so a
            // concurrent add between check and await cannot be lost.
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Releases the in-flight hold on `key`. If a notification arrived
    /// while the key was in flight, it goes back on the ready queue now.
    pub fn done(&self, key: &str) {
        let mut state = self.lock_state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.ready.push_back(key.to_string());
            drop(state);
            self.inner.wakeup.notify_one();
        }
    }

    /// Clears the consecutive-failure history for `key`.
    pub fn forget(&self, key: &str) {
        let mut state = self.lock_state();
        state.failures.remove(key);
    }

    /// Consecutive failed attempts recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        let state = self.lock_state();
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Re-queues `key` after a backoff that doubles with each consecutive
    /// failure, from 5ms up to a 1000s cap. The base delay is the minimum
    /// spacing between retries.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock_state();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let exponent = *failures;
            *failures += 1;
            backoff_for(exponent)
        };
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Signals shutdown: blocked `get` calls return `None`, later `add`
    /// calls are dropped, in-flight keys may still be `done`d.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
        }
        self.inner.wakeup.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock_state().ready.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("work queue lock poisoned")
    }
}

impl EnqueueKey for WorkQueue {
    fn enqueue(&self, key: &str) {
        self.add(key);
    }
}

fn backoff_for(consecutive_failures: u32) -> Duration {
    BASE_DELAY
        .checked_mul(1u32 << consecutive_failures.min(31))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}
