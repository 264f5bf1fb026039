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

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::podwatch::k8s::meta::{KubeObject, ObjectMeta};

/// Derives the cache key for an object: `<namespace>/<name>`, or `<name>`
/// alone for cluster-scoped objects. The same logical object always yields
/// the same key across add/update/delete.
pub fn object_key(metadata: &ObjectMeta) -> String {
    let name = metadata.name.as_deref().unwrap_or_default();
    match metadata.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    }
}

/// Splits a cache key back into `(namespace, name)`. Keys with more than
/// one separator are malformed and cannot self-heal by retrying.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let mut parts = key.split('/');
    let first = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (None, _) => Ok((None, first)),
        (Some(name), None) => Ok((Some(first), name)),
        (Some(_), Some(_)) => Err(KeyError {
            key: key.to_string(),
        }),
    }
}

#[derive(Debug)]
pub struct KeyError {
    pub key: String,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected key format: {:?}", self.key)
    }
}

impl Error for KeyError {}

/// Keyed cache of the last-observed object per key.
///
/// Written only by the informer replay; workers hold read-only clones of
/// the handle and never mutate it. Entries exist only for currently-present
/// objects, deletion removes the entry rather than marking it.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<HashMap<String, KubeObject>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<KubeObject> {
        let cache = self.inner.read().expect("store lock poisoned");
        cache.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        let cache = self.inner.read().expect("store lock poisoned");
        cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, key: String, object: KubeObject) {
        let mut cache = self.inner.write().expect("store lock poisoned");
        cache.insert(key, object);
    }

    pub(crate) fn remove(&self, key: &str) -> Option<KubeObject> {
        let mut cache = self.inner.write().expect("store lock poisoned");
        cache.remove(key)
    }

    /// Swaps in a full list snapshot and returns the keys that were cached
    /// before but are absent from the snapshot. Those are deletions the
    /// watch stream missed; the caller enqueues them from this last-known
    /// identity (the tombstone path).
    pub(crate) fn replace(&self, objects: Vec<(String, KubeObject)>) -> Vec<String> {
        let mut cache = self.inner.write().expect("store lock poisoned");
        let mut fresh: HashMap<String, KubeObject> = HashMap::with_capacity(objects.len());
        for (key, object) in objects {
            fresh.insert(key, object);
        }
        let vanished = cache
            .keys()
            .filter(|key| !fresh.contains_key(*key))
            .cloned()
            .collect();
        *cache = fresh;
        vanished
    }
}
